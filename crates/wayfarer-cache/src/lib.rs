//! Query cache and optimistic mutations.
//!
//! Cached server data is addressed by typed [`CacheKey`]s and held in a
//! [`QueryStore`]. [`OptimisticMutation`] writes a predicted value before the
//! server answers, rolls back on failure and refetches on settle, so the cache
//! always converges on server truth.

mod key;
mod mutation;
mod presets;
mod store;

pub use key::{CacheKey, FeedScope, KeyFamily, KeyFilter, NotificationScope};
pub use mutation::{MutationError, MutationPhase, OptimisticMutation, Updater};
pub use presets::{
    like_comment, like_post, like_short, mark_all_notifications_read, mark_notification_read,
    notification_invalidations, patch_entities, save_place, save_post,
};
pub use store::{FetchError, Fetcher, MemoryStore, QueryStore};
