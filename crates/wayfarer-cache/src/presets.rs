//! Mutations used by the app's interaction points.
//!
//! Cached queries hold JSON entity trees (lists, pages, detail objects). The
//! updaters here walk the whole tree and patch every object whose `id` matches,
//! so one prediction covers a post in the home feed, in a profile feed and on its
//! detail page at the same time.

use crate::key::{CacheKey, KeyFamily, KeyFilter};
use crate::mutation::OptimisticMutation;
use serde_json::{Map, Value};
use wayfarer_core::{CommentId, NotificationId, NotificationKind, PlaceId, PostId, ShortId};

/// Apply `patch` to every object in `value` whose `id` equals `id`.
pub fn patch_entities(value: &Value, id: &str, patch: &dyn Fn(&mut Map<String, Value>)) -> Value {
    let mut value = value.clone();
    patch_in_place(&mut value, &|obj| {
        if obj.get("id").and_then(Value::as_str) == Some(id) {
            patch(obj);
        }
    });
    value
}

fn patch_in_place(value: &mut Value, patch: &dyn Fn(&mut Map<String, Value>)) {
    match value {
        Value::Object(obj) => {
            patch(obj);
            for child in obj.values_mut() {
                patch_in_place(child, patch);
            }
        }
        Value::Array(items) => {
            for item in items {
                patch_in_place(item, patch);
            }
        }
        _ => {}
    }
}

/// Set `liked` and adjust `likes` by one if the flag actually changes.
fn set_liked(obj: &mut Map<String, Value>, liked: bool) {
    let was = obj.get("liked").and_then(Value::as_bool).unwrap_or(false);
    obj.insert("liked".into(), Value::Bool(liked));
    if was == liked {
        return;
    }
    let likes = obj.get("likes").and_then(Value::as_i64).unwrap_or(0);
    let likes = if liked { likes + 1 } else { (likes - 1).max(0) };
    obj.insert("likes".into(), Value::from(likes));
}

fn set_flag(obj: &mut Map<String, Value>, field: &str, on: bool) {
    obj.insert(field.into(), Value::Bool(on));
}

pub fn like_post(post: &PostId, liked: bool) -> OptimisticMutation {
    let id = post.to_string();
    OptimisticMutation::new(if liked { "like-post" } else { "unlike-post" })
        .target(KeyFamily::Feed)
        .target(CacheKey::Post(post.clone()))
        .target(CacheKey::SavedPosts)
        .update(move |_, v| patch_entities(v, &id, &|obj| set_liked(obj, liked)))
}

pub fn save_post(post: &PostId, saved: bool) -> OptimisticMutation {
    let id = post.to_string();
    OptimisticMutation::new(if saved { "save-post" } else { "unsave-post" })
        .target(KeyFamily::Feed)
        .target(CacheKey::Post(post.clone()))
        .update(move |_, v| patch_entities(v, &id, &|obj| set_flag(obj, "saved", saved)))
        .also_invalidate(CacheKey::SavedPosts)
}

pub fn like_comment(post: &PostId, comment: &CommentId, liked: bool) -> OptimisticMutation {
    let id = comment.to_string();
    OptimisticMutation::new(if liked { "like-comment" } else { "unlike-comment" })
        .target(CacheKey::Comments(post.clone()))
        .update(move |_, v| patch_entities(v, &id, &|obj| set_liked(obj, liked)))
}

pub fn like_short(short: &ShortId, liked: bool) -> OptimisticMutation {
    let id = short.to_string();
    OptimisticMutation::new(if liked { "like-short" } else { "unlike-short" })
        .target(CacheKey::Shorts)
        .target(CacheKey::Short(short.clone()))
        .update(move |_, v| patch_entities(v, &id, &|obj| set_liked(obj, liked)))
}

pub fn save_place(place: &PlaceId, saved: bool) -> OptimisticMutation {
    let id = place.to_string();
    OptimisticMutation::new(if saved { "save-place" } else { "unsave-place" })
        .target(CacheKey::Places)
        .target(CacheKey::Place(place.clone()))
        .update(move |_, v| patch_entities(v, &id, &|obj| set_flag(obj, "saved", saved)))
        .also_invalidate(CacheKey::SavedPlaces)
}

pub fn mark_notification_read(notification: &NotificationId) -> OptimisticMutation {
    let id = notification.to_string();
    OptimisticMutation::new("mark-notification-read")
        .target(KeyFamily::Notifications)
        .update(move |_, v| patch_entities(v, &id, &|obj| set_flag(obj, "read", true)))
        .also_invalidate(CacheKey::NotificationCount)
}

pub fn mark_all_notifications_read() -> OptimisticMutation {
    OptimisticMutation::new("mark-all-notifications-read")
        .target(KeyFamily::Notifications)
        .target(CacheKey::NotificationCount)
        .update(|key, v| match key {
            CacheKey::NotificationCount => zero_count(v),
            _ => {
                let mut v = v.clone();
                patch_in_place(&mut v, &|obj| {
                    if obj.contains_key("read") {
                        set_flag(obj, "read", true);
                    }
                });
                v
            }
        })
}

/// The unread count is either a bare number or `{"count": n}`.
fn zero_count(value: &Value) -> Value {
    match value {
        Value::Object(obj) if obj.contains_key("count") => {
            let mut obj = obj.clone();
            obj.insert("count".into(), Value::from(0));
            Value::Object(obj)
        }
        _ => Value::from(0),
    }
}

/// Queries a consumer should invalidate when a notification event arrives.
///
/// Every event changes both the notification lists and the unread count.
pub fn notification_invalidations(kind: NotificationKind) -> Vec<KeyFilter> {
    tracing::debug!("{} invalidates notification queries", kind);
    vec![
        KeyFamily::Notifications.into(),
        CacheKey::NotificationCount.into(),
    ]
}
