//! Persisted set of channels currently subscribed at the hub.
//!
//! Stored as a sorted JSON array so diffs between runs stay readable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::atomic::{Result, read_json_opt, write_json_atomic};
use crate::types::ChannelId;

/// File-backed subscribed-channel set.
#[derive(Debug)]
pub struct SubscriptionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SubscriptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SubscriptionStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the set; a missing file means nothing is subscribed yet.
    pub fn load(&self) -> Result<BTreeSet<ChannelId>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(read_json_opt::<Vec<ChannelId>>(&self.path)?
            .map(|v| v.into_iter().collect())
            .unwrap_or_default())
    }

    /// Replaces the persisted set.
    pub fn save(&self, channels: &BTreeSet<ChannelId>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let ordered: Vec<&ChannelId> = channels.iter().collect();
        write_json_atomic(&self.path, &ordered)
    }
}
