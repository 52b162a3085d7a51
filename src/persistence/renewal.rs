//! Persisted time of the last subscription renewal pass.
//!
//! Kept separately from the subscribed set so that a restart resumes the
//! renewal cadence instead of resetting it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::atomic::{Result, read_json_opt, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RenewalRecord {
    last_renewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RenewalClock {
    path: PathBuf,
}

impl RenewalClock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RenewalClock { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last renewal time, or `None` if no pass has completed yet.
    pub fn last_renewed(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(read_json_opt::<RenewalRecord>(&self.path)?.map(|r| r.last_renewed_at))
    }

    pub fn mark_renewed(&self, at: DateTime<Utc>) -> Result<()> {
        write_json_atomic(&self.path, &RenewalRecord { last_renewed_at: at })
    }
}
