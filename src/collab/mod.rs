//! Capability traits for the external collaborators of the pipeline.
//!
//! The pipeline never downloads, uploads or queries platforms itself. It calls
//! a [`Fetcher`] to turn a source URL into a local file, a [`Publisher`] to
//! republish that file, and a [`MetadataSource`] to decide whether a YouTube
//! item qualifies at all.
//!
//! The shipped implementations are thin: [`command::CommandFetcher`] and
//! [`command::CommandPublisher`] run external programs, and
//! [`metadata::YouTubeDataApi`] queries the YouTube Data API.

pub mod command;
pub mod metadata;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::retry::Retryable;
use crate::types::{ChannelId, ItemId, PublishTask};

pub use command::{CommandFetcher, CommandPublisher};
pub use metadata::{YouTubeDataApi, parse_iso8601_duration};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to start fetcher: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("fetcher exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("fetcher timed out after {0:?}")]
    Timeout(Duration),

    #[error("fetcher succeeded but produced no file for {0}")]
    MissingOutput(ItemId),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Spawn(_))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to start publisher: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("publisher exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("publisher timed out after {0:?}")]
    Timeout(Duration),

    #[error("publisher rejected item: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata API returned status {0}")]
    Status(u16),

    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("unexpected metadata response: {0}")]
    Malformed(String),
}

impl Retryable for MetadataError {
    fn is_transient(&self) -> bool {
        match self {
            MetadataError::Http(e) => !e.is_builder(),
            MetadataError::Status(code) => *code == 429 || *code >= 500,
            MetadataError::NotFound(_) | MetadataError::Malformed(_) => false,
        }
    }
}

/// What the pipeline needs to know about a YouTube item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub item_id: ItemId,
    pub channel_id: Option<ChannelId>,
    pub title: Option<String>,
    pub published_at: DateTime<Utc>,
    /// `None` when the reported duration could not be parsed.
    pub duration: Option<Duration>,
}

/// Turns a source URL into a local media file.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        channel: &ChannelId,
        url: &str,
        item: &ItemId,
    ) -> impl Future<Output = Result<PathBuf, FetchError>> + Send;
}

/// Republishes a local media file on the destination platform.
pub trait Publisher: Send + Sync + 'static {
    fn publish(
        &self,
        path: &Path,
        task: &PublishTask,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

pub trait MetadataSource: Send + Sync + 'static {
    fn video_metadata(
        &self,
        item: &ItemId,
    ) -> impl Future<Output = Result<VideoMetadata, MetadataError>> + Send;
}
