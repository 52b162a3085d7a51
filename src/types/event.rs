//! Notification and pipeline task types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::ids::{ChannelId, ItemId, ItemKey, Platform};
use crate::pipeline::InFlightClaim;

/// A parsed webhook notification for one media item.
///
/// Produced by the ingress, consumed by the fetch stage. Never mutated after
/// it has been enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub platform: Platform,
    pub channel_id: ChannelId,
    pub item_id: ItemId,
    /// Where the Fetcher should retrieve the media from.
    pub source_url: String,
    /// Already-materialized media; the fetch stage skips the Fetcher when set.
    pub local_path: Option<PathBuf>,
    /// Submitted by an operator rather than pushed by the hub.
    pub manual: bool,
    pub received_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Builds a hub-pushed YouTube notification.
    pub fn youtube(channel_id: ChannelId, item_id: ItemId) -> Self {
        let source_url = youtube_watch_url(&item_id);
        NotificationEvent {
            platform: Platform::youtube(),
            channel_id,
            item_id,
            source_url,
            local_path: None,
            manual: false,
            received_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.platform.clone(), self.item_id.clone())
    }
}

/// Canonical watch URL for a YouTube video id.
pub fn youtube_watch_url(item_id: &ItemId) -> String {
    format!("https://www.youtube.com/watch?v={}", item_id)
}

/// Element of the fetch queue.
///
/// The claim keeps the item marked as in flight until the task is dropped,
/// whichever stage that happens in.
#[derive(Debug)]
pub struct FetchTask {
    pub event: NotificationEvent,
    pub claim: InFlightClaim,
}

/// Element of the publish queue, carrying the media produced by the fetch stage.
#[derive(Debug)]
pub struct PublishTask {
    pub item_id: ItemId,
    pub channel_id: ChannelId,
    pub platform: Platform,
    pub local_path: PathBuf,
    pub claim: InFlightClaim,
}

impl PublishTask {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.platform.clone(), self.item_id.clone())
    }
}
