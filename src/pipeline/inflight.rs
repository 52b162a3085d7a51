//! Tracking of items between admission and the end of the publish stage.
//!
//! A claim is taken at admission and travels inside the fetch task, then the
//! publish task. Dropping it, on success, discard or failure alike, releases
//! the key, so an item is never stuck "in flight" after it leaves the
//! pipeline.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::types::ItemKey;

#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    keys: Arc<Mutex<HashSet<ItemKey>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`, or returns `None` if it is already in flight.
    pub fn try_claim(&self, key: ItemKey) -> Option<InFlightClaim> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightClaim {
            key,
            keys: Arc::clone(&self.keys),
        })
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.contains(key)
    }

    pub fn len(&self) -> usize {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof that an item is in flight. Released on drop.
pub struct InFlightClaim {
    key: ItemKey,
    keys: Arc<Mutex<HashSet<ItemKey>>>,
}

impl InFlightClaim {
    pub fn key(&self) -> &ItemKey {
        &self.key
    }
}

impl fmt::Debug for InFlightClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightClaim").field("key", &self.key).finish()
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}
