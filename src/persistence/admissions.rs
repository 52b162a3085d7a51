//! Per-channel last-admitted timestamps.
//!
//! Stored as JSON Lines, one record per channel:
//!
//! ```text
//! {"channel_id":"UC123","last_time":"2025-06-01T12:00:00Z"}
//! ```
//!
//! The whole file is rewritten atomically on every change. Lines that fail
//! to parse (hand edits, an older format) are skipped with a warning rather
//! than failing startup; the worst outcome is one extra admission.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::atomic::{Result, StoreError, write_atomic};
use crate::types::ChannelId;

/// One line of the admissions file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub channel_id: ChannelId,
    pub last_time: DateTime<Utc>,
}

/// File-backed store for [`AdmissionRecord`]s.
#[derive(Debug, Clone)]
pub struct AdmissionStore {
    path: PathBuf,
}

impl AdmissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AdmissionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all records; later lines win over earlier ones for the same channel.
    pub fn load(&self) -> Result<HashMap<ChannelId, DateTime<Utc>>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut map = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<AdmissionRecord>(trimmed) {
                Ok(record) => {
                    map.insert(record.channel_id, record.last_time);
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed admission record"
                    );
                }
            }
        }
        Ok(map)
    }

    /// Rewrites the file with one line per channel, sorted by channel id.
    pub fn save(&self, map: &HashMap<ChannelId, DateTime<Utc>>) -> Result<()> {
        let mut records: Vec<AdmissionRecord> = map
            .iter()
            .map(|(channel_id, last_time)| AdmissionRecord {
                channel_id: channel_id.clone(),
                last_time: *last_time,
            })
            .collect();
        records.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        let mut out = String::new();
        for record in &records {
            let line =
                serde_json::to_string(record).map_err(|e| StoreError::json(&self.path, e))?;
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{}", line);
        }
        write_atomic(&self.path, out.as_bytes())
    }
}
