//! Persistence layer.
//!
//! Three independent stores plus the renewal clock, all small JSON files that
//! are rewritten in full through [`atomic::write_atomic`].
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   subscribed_channels.json   # sorted JSON array of channel ids
//!   history.json               # platform -> [item ids], published items only
//!   last_admitted.jsonl        # one {channel_id, last_time} record per line
//!   renewal.json               # time of the last renewal pass
//! ```
//!
//! # Crash Safety
//!
//! - Writes use write-to-temp-then-rename with fsync on the file and directory
//! - Each store serializes its own load-modify-persist sequences

pub mod admissions;
pub mod atomic;
pub mod history;
pub mod renewal;
pub mod subscriptions;

use std::path::Path;

pub use admissions::{AdmissionRecord, AdmissionStore};
pub use atomic::{StoreError, fsync_dir, fsync_file, write_atomic, write_json_atomic};
pub use history::HistoryStore;
pub use renewal::RenewalClock;
pub use subscriptions::SubscriptionStore;

pub const SUBSCRIPTIONS_FILE: &str = "subscribed_channels.json";
pub const HISTORY_FILE: &str = "history.json";
pub const ADMISSIONS_FILE: &str = "last_admitted.jsonl";
pub const RENEWAL_FILE: &str = "renewal.json";

/// All persisted state for one deployment.
#[derive(Debug)]
pub struct StateStores {
    pub subscriptions: SubscriptionStore,
    pub history: HistoryStore,
    pub admissions: AdmissionStore,
    pub renewal: RenewalClock,
}

impl StateStores {
    /// Opens every store under `state_dir`, creating the directory if needed.
    pub fn open(state_dir: &Path) -> atomic::Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| StoreError::io(state_dir, e))?;
        Ok(StateStores {
            subscriptions: SubscriptionStore::new(state_dir.join(SUBSCRIPTIONS_FILE)),
            history: HistoryStore::open(state_dir.join(HISTORY_FILE))?,
            admissions: AdmissionStore::new(state_dir.join(ADMISSIONS_FILE)),
            renewal: RenewalClock::new(state_dir.join(RENEWAL_FILE)),
        })
    }
}
