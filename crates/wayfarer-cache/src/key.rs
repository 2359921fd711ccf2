//! Typed cache keys.
//!
//! Every cached query is addressed by a [`CacheKey`]. Keys group into a
//! [`KeyFamily`] so that "every feed" or "every notification list" can be
//! targeted with a [`KeyFilter`] without listing concrete keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use wayfarer_core::{PlaceId, PostId, ShortId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedScope {
    Home,
    Following,
    User(UserId),
    Place(PlaceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationScope {
    All,
    Unread,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    Feed(FeedScope),
    Post(PostId),
    SavedPosts,
    Comments(PostId),
    Shorts,
    Short(ShortId),
    Notifications(NotificationScope),
    NotificationCount,
    Places,
    Place(PlaceId),
    SavedPlaces,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFamily {
    Feed,
    Post,
    SavedPosts,
    Comments,
    Shorts,
    Short,
    Notifications,
    NotificationCount,
    Places,
    Place,
    SavedPlaces,
}

impl CacheKey {
    pub fn family(&self) -> KeyFamily {
        match self {
            CacheKey::Feed(_) => KeyFamily::Feed,
            CacheKey::Post(_) => KeyFamily::Post,
            CacheKey::SavedPosts => KeyFamily::SavedPosts,
            CacheKey::Comments(_) => KeyFamily::Comments,
            CacheKey::Shorts => KeyFamily::Shorts,
            CacheKey::Short(_) => KeyFamily::Short,
            CacheKey::Notifications(_) => KeyFamily::Notifications,
            CacheKey::NotificationCount => KeyFamily::NotificationCount,
            CacheKey::Places => KeyFamily::Places,
            CacheKey::Place(_) => KeyFamily::Place,
            CacheKey::SavedPlaces => KeyFamily::SavedPlaces,
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyFamily::Feed => "feed",
            KeyFamily::Post => "post",
            KeyFamily::SavedPosts => "saved-posts",
            KeyFamily::Comments => "comments",
            KeyFamily::Shorts => "shorts",
            KeyFamily::Short => "short",
            KeyFamily::Notifications => "notifications",
            KeyFamily::NotificationCount => "notification-count",
            KeyFamily::Places => "places",
            KeyFamily::Place => "place",
            KeyFamily::SavedPlaces => "saved-places",
        };
        f.write_str(s)
    }
}

/// Path-like rendering used in logs, e.g. `feed/user/u1` or `comments/p9`.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = self.family();
        match self {
            CacheKey::Feed(FeedScope::Home) => write!(f, "{family}/home"),
            CacheKey::Feed(FeedScope::Following) => write!(f, "{family}/following"),
            CacheKey::Feed(FeedScope::User(id)) => write!(f, "{family}/user/{id}"),
            CacheKey::Feed(FeedScope::Place(id)) => write!(f, "{family}/place/{id}"),
            CacheKey::Post(id) | CacheKey::Comments(id) => write!(f, "{family}/{id}"),
            CacheKey::Short(id) => write!(f, "{family}/{id}"),
            CacheKey::Place(id) => write!(f, "{family}/{id}"),
            CacheKey::Notifications(NotificationScope::All) => write!(f, "{family}/all"),
            CacheKey::Notifications(NotificationScope::Unread) => write!(f, "{family}/unread"),
            CacheKey::SavedPosts
            | CacheKey::Shorts
            | CacheKey::NotificationCount
            | CacheKey::Places
            | CacheKey::SavedPlaces => write!(f, "{family}"),
        }
    }
}

/// Selects a set of keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyFilter {
    Exact(CacheKey),
    Family(KeyFamily),
    Any,
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Family(family) => key.family() == *family,
            KeyFilter::Any => true,
        }
    }
}

impl From<CacheKey> for KeyFilter {
    fn from(key: CacheKey) -> Self {
        KeyFilter::Exact(key)
    }
}

impl From<KeyFamily> for KeyFilter {
    fn from(family: KeyFamily) -> Self {
        KeyFilter::Family(family)
    }
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFilter::Exact(key) => write!(f, "{key}"),
            KeyFilter::Family(family) => write!(f, "{family}/*"),
            KeyFilter::Any => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_filter_matches_every_scope() {
        let filter = KeyFilter::from(KeyFamily::Feed);
        assert!(filter.matches(&CacheKey::Feed(FeedScope::Home)));
        assert!(filter.matches(&CacheKey::Feed(FeedScope::User(UserId::from("u1")))));
        assert!(!filter.matches(&CacheKey::Post(PostId::from("p1"))));
    }

    #[test]
    fn exact_filter_compares_ids() {
        let filter = KeyFilter::from(CacheKey::Comments(PostId::from("p1")));
        assert!(filter.matches(&CacheKey::Comments(PostId::from("p1"))));
        assert!(!filter.matches(&CacheKey::Comments(PostId::from("p2"))));
        assert!(!filter.matches(&CacheKey::Post(PostId::from("p1"))));
    }

    #[test]
    fn any_matches_everything() {
        assert!(KeyFilter::Any.matches(&CacheKey::SavedPlaces));
    }

    #[test]
    fn display() {
        assert_eq!(
            CacheKey::Feed(FeedScope::User(UserId::from("u1"))).to_string(),
            "feed/user/u1"
        );
        assert_eq!(CacheKey::NotificationCount.to_string(), "notification-count");
        assert_eq!(KeyFilter::Family(KeyFamily::Notifications).to_string(), "notifications/*");
    }
}
