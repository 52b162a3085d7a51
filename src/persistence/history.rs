//! Processed-item history, keyed by platform.
//!
//! An entry is written only after a successful publish. Presence of
//! `(platform, item)` means the item must never be admitted again.
//!
//! # File Format
//!
//! ```text
//! {
//!   "youtube": ["dQw4w9WgXcQ", "..."],
//!   "tiktok": ["7506491557038640406"]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use super::atomic::{Result, StoreError, quarantine, read_json_opt, write_json_atomic};
use crate::types::{ItemId, ItemKey, Platform};

type HistoryMap = BTreeMap<Platform, Vec<ItemId>>;

/// In-memory cache of the history file with write-through persistence.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    data: Mutex<HistoryMap>,
}

impl HistoryStore {
    /// Opens the history file, creating an empty history if none exists.
    ///
    /// An unreadable file is moved aside as `<file>.corrupt` and replaced by an
    /// empty history; losing dedup state is preferable to refusing to start.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match read_json_opt::<HistoryMap>(&path) {
            Ok(data) => data.unwrap_or_default(),
            Err(StoreError::Json { source, .. }) => {
                let moved = quarantine(&path).map_err(|e| StoreError::io(&path, e))?;
                warn!(
                    path = %path.display(),
                    moved_to = %moved.display(),
                    error = %source,
                    "History file unreadable, starting with empty history"
                );
                HistoryMap::new()
            }
            Err(e) => return Err(e),
        };

        let entries: usize = data.values().map(Vec::len).sum();
        info!(path = %path.display(), entries, "Loaded processed-item history");

        Ok(HistoryStore {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the item has already been published.
    pub fn is_processed(&self, key: &ItemKey) -> bool {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(&key.platform)
            .is_some_and(|items| items.contains(&key.item))
    }

    /// Records a successful publish.
    ///
    /// Idempotent: recording an item twice leaves the file untouched the second
    /// time. Returns `true` if the item was newly recorded.
    pub fn record(&self, key: &ItemKey) -> Result<bool> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let items = data.entry(key.platform.clone()).or_default();
        if items.contains(&key.item) {
            return Ok(false);
        }
        items.push(key.item.clone());

        if let Err(e) = write_json_atomic(&self.path, &*data) {
            // Keep memory and disk in agreement: the caller will retry or alert.
            if let Some(items) = data.get_mut(&key.platform) {
                items.retain(|i| i != &key.item);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Number of recorded items across all platforms.
    pub fn len(&self) -> usize {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
