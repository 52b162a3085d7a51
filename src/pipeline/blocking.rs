//! Adapters for synchronous collaborators.
//!
//! A [`BlockingFetcher`] or [`BlockingPublisher`] wrapped in [`Blocking`]
//! runs on tokio's blocking thread pool. A semaphore bounds how many such
//! calls run at once, independently of the worker pool sizes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::collab::{FetchError, Fetcher, PublishError, Publisher};
use crate::types::{ChannelId, ItemId, Platform, PublishTask};

pub trait BlockingFetcher: Send + Sync + 'static {
    fn fetch_blocking(
        &self,
        channel: &ChannelId,
        url: &str,
        item: &ItemId,
    ) -> Result<PathBuf, FetchError>;
}

pub trait BlockingPublisher: Send + Sync + 'static {
    fn publish_blocking(
        &self,
        path: &Path,
        item: &ItemId,
        channel: &ChannelId,
        platform: &Platform,
    ) -> Result<(), PublishError>;
}

pub struct Blocking<T> {
    inner: Arc<T>,
    permits: Arc<Semaphore>,
}

impl<T> Clone for Blocking<T> {
    fn clone(&self) -> Self {
        Blocking {
            inner: Arc::clone(&self.inner),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<T> Blocking<T> {
    pub fn new(inner: T, max_concurrent: usize) -> Self {
        Blocking {
            inner: Arc::new(inner),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<T: BlockingFetcher> Fetcher for Blocking<T> {
    async fn fetch(
        &self,
        channel: &ChannelId,
        url: &str,
        item: &ItemId,
    ) -> Result<PathBuf, FetchError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e)))?;
        let inner = Arc::clone(&self.inner);
        let (channel, url, item) = (channel.clone(), url.to_string(), item.clone());
        tokio::task::spawn_blocking(move || inner.fetch_blocking(&channel, &url, &item))
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e)))?
    }
}

impl<T: BlockingPublisher> Publisher for Blocking<T> {
    async fn publish(&self, path: &Path, task: &PublishTask) -> Result<(), PublishError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        let (item, channel, platform) = (
            task.item_id.clone(),
            task.channel_id.clone(),
            task.platform.clone(),
        );
        tokio::task::spawn_blocking(move || {
            inner.publish_blocking(&path, &item, &channel, &platform)
        })
        .await
        .map_err(|e| PublishError::Failed {
            status: "blocking task aborted".to_string(),
            stderr: e.to_string(),
        })?
    }
}
