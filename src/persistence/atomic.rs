//! Durable whole-file replacement.
//!
//! Every store in this crate is small enough to be rewritten in full on each
//! change. Writes go through write-to-temp-then-rename:
//! 1. Write to `<file>.tmp`
//! 2. fsync the temp file
//! 3. Rename over the target
//! 4. fsync the parent directory
//!
//! Readers therefore observe either the previous or the new contents, never a
//! partial write, even across a crash.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors shared by the persisted stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that a rename inside it survives power loss.
///
/// Only call this with directory paths.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Atomically replaces `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(bytes)
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        fsync_file(&file).map_err(|e| StoreError::io(&tmp_path, e))?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))?;

    if let Some(parent) = parent {
        fsync_dir(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    Ok(())
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    write_atomic(path, &bytes)
}

/// Reads and deserializes a JSON file, returning `None` if it does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::json(path, e))?;
    Ok(Some(value))
}

/// Moves an unreadable file aside as `<file>.corrupt` so a fresh one can be started.
///
/// Returns the path the file was moved to.
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    let target = PathBuf::from(name);
    std::fs::rename(path, &target)?;
    Ok(target)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
