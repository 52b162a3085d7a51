//! Core domain types for the republishing pipeline.
//!
//! Identifiers are newtypes so that channel ids, item ids and platform tags
//! cannot be mixed up as they flow from the webhook through both stages.

pub mod event;
pub mod ids;

pub use event::{FetchTask, NotificationEvent, PublishTask, youtube_watch_url};
pub use ids::{ChannelId, ItemId, ItemKey, Platform};
