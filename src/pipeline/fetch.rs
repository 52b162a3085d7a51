//! Fetch stage: turns admitted events into local media files.
//!
//! For each task a worker:
//!
//! 1. Discards items already in the history.
//! 2. For YouTube items with a metadata source, requires the item to be
//!    recent (manual submissions excepted) and short-form. Items failing
//!    either check are discarded silently; a lookup that keeps failing after
//!    its retries is discarded with an alert.
//! 3. Uses the local-path hint when present, otherwise calls the Fetcher with
//!    bounded retries; exhaustion raises an alert. A hint must name a file
//!    under the media root, since the file is deleted once the item leaves
//!    the pipeline.
//! 4. Offers a [`PublishTask`] to the publish queue without waiting. A full
//!    queue deletes the file and raises an alert.
//!
//! Collaborator calls race against the shutdown token; an abandoned task
//! releases its in-flight claim like any other.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::queue::{BoundedQueue, QueueError};
use crate::alert::{AlertKind, Alerter};
use crate::collab::{Fetcher, MetadataSource, VideoMetadata};
use crate::persistence::StateStores;
use crate::retry::{RetryConfig, RetryResult, retry};
use crate::types::{FetchTask, NotificationEvent, PublishTask};

/// Recency and duration limits for YouTube items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemFilter {
    pub recent_window: Duration,
    pub max_duration: Duration,
}

impl Default for ItemFilter {
    fn default() -> Self {
        ItemFilter {
            recent_window: Duration::from_secs(120),
            max_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotRecent { published_at: DateTime<Utc> },
    TooLong { duration: Duration },
    UnknownDuration,
}

impl ItemFilter {
    pub fn check(
        &self,
        meta: &VideoMetadata,
        manual: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SkipReason> {
        if !manual {
            let age = now.signed_duration_since(meta.published_at);
            // Negative ages (clock skew) count as recent.
            if age.to_std().is_ok_and(|age| age > self.recent_window) {
                return Err(SkipReason::NotRecent {
                    published_at: meta.published_at,
                });
            }
        }
        match meta.duration {
            None => Err(SkipReason::UnknownDuration),
            Some(duration) if duration > self.max_duration => Err(SkipReason::TooLong { duration }),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchStageConfig {
    pub filter: ItemFilter,
    pub fetch_retry: RetryConfig,
    pub metadata_retry: RetryConfig,
}

impl Default for FetchStageConfig {
    fn default() -> Self {
        FetchStageConfig {
            filter: ItemFilter::default(),
            fetch_retry: RetryConfig::fixed(3, Duration::from_secs(3)),
            metadata_retry: RetryConfig::fixed(3, Duration::from_secs(3)),
        }
    }
}

/// How one fetch task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Queued,
    AlreadyProcessed,
    Skipped(SkipReason),
    MetadataUnavailable,
    MissingLocalFile,
    OutsideMediaRoot,
    FetchFailed,
    PublishQueueFull,
    Abandoned,
}

enum Media {
    Ready(PathBuf),
    Done(FetchOutcome),
}

pub struct FetchStage<F, M> {
    fetcher: F,
    media_root: PathBuf,
    metadata: Option<M>,
    stores: Arc<StateStores>,
    publish_queue: BoundedQueue<PublishTask>,
    alerter: Alerter,
    config: FetchStageConfig,
}

impl<F: Fetcher, M: MetadataSource> FetchStage<F, M> {
    pub fn new(
        fetcher: F,
        media_root: impl Into<PathBuf>,
        metadata: Option<M>,
        stores: Arc<StateStores>,
        publish_queue: BoundedQueue<PublishTask>,
        alerter: Alerter,
        config: FetchStageConfig,
    ) -> Self {
        FetchStage {
            fetcher,
            media_root: media_root.into(),
            metadata,
            stores,
            publish_queue,
            alerter,
            config,
        }
    }

    /// Worker loop: pops tasks until shutdown.
    pub async fn run_worker(
        self: Arc<Self>,
        worker: usize,
        queue: BoundedQueue<FetchTask>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let outcome = self.process(task, &shutdown).await;
            debug!(worker, ?outcome, "Fetch task finished");
        }
    }

    #[instrument(skip_all, fields(item = %task.event.item_id, channel = %task.event.channel_id))]
    pub async fn process(&self, task: FetchTask, shutdown: &CancellationToken) -> FetchOutcome {
        let FetchTask { event, claim } = task;

        if self.stores.history.is_processed(&event.key()) {
            debug!("Already processed, discarding");
            return FetchOutcome::AlreadyProcessed;
        }

        let media = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown during fetch, abandoning item");
                return FetchOutcome::Abandoned;
            }
            media = self.obtain_media(&event) => media,
        };
        let path = match media {
            Media::Ready(path) => path,
            Media::Done(outcome) => return outcome,
        };

        let publish = PublishTask {
            item_id: event.item_id,
            channel_id: event.channel_id,
            platform: event.platform,
            local_path: path,
            claim,
        };
        match self.publish_queue.try_push(publish) {
            Ok(()) => {
                debug!(depth = self.publish_queue.len(), "Queued for publishing");
                FetchOutcome::Queued
            }
            Err(e) => {
                let reason = match &e {
                    QueueError::Full(_) => "full",
                    QueueError::Closed(_) => "closed",
                };
                let task = e.into_inner();
                warn!(
                    path = %task.local_path.display(),
                    reason,
                    "Publish queue rejected item, deleting media"
                );
                remove_media(&task.local_path).await;
                self.alerter.raise(
                    AlertKind::PublishQueueFull,
                    format!(
                        "publish queue {} (capacity {}), dropped {} and deleted {}",
                        reason,
                        self.publish_queue.capacity(),
                        task.item_id,
                        task.local_path.display()
                    ),
                );
                FetchOutcome::PublishQueueFull
            }
        }
    }

    async fn obtain_media(&self, event: &NotificationEvent) -> Media {
        if event.platform.is_youtube()
            && let Some(metadata) = &self.metadata
        {
            let item = &event.item_id;
            let result =
                retry(self.config.metadata_retry, move || metadata.video_metadata(item)).await;
            let meta = match result {
                RetryResult::Success(meta) => meta,
                RetryResult::ExhaustedRetries { last_error, attempts } => {
                    warn!(attempts, error = %last_error, "Metadata unavailable, discarding");
                    self.alerter.raise(
                        AlertKind::MetadataUnavailable,
                        format!(
                            "metadata for {} unavailable after {} attempt(s), discarded: {}",
                            item, attempts, last_error
                        ),
                    );
                    return Media::Done(FetchOutcome::MetadataUnavailable);
                }
                RetryResult::PermanentError(e) => {
                    warn!(error = %e, "Metadata unavailable, discarding");
                    return Media::Done(FetchOutcome::MetadataUnavailable);
                }
            };
            if let Err(reason) = self.config.filter.check(&meta, event.manual, Utc::now()) {
                info!(?reason, "Item does not qualify, discarding");
                return Media::Done(FetchOutcome::Skipped(reason));
            }
        }

        if let Some(path) = &event.local_path {
            return self.supplied_media(path).await;
        }

        let fetcher = &self.fetcher;
        let result = retry(self.config.fetch_retry, move || {
            fetcher.fetch(&event.channel_id, &event.source_url, &event.item_id)
        })
        .await;
        match result {
            RetryResult::Success(path) => Media::Ready(path),
            RetryResult::ExhaustedRetries { last_error, attempts } => {
                self.fetch_failed(event, &last_error.to_string(), attempts);
                Media::Done(FetchOutcome::FetchFailed)
            }
            RetryResult::PermanentError(e) => {
                self.fetch_failed(event, &e.to_string(), 1);
                Media::Done(FetchOutcome::FetchFailed)
            }
        }
    }

    /// Accepts a local-path hint only for a regular file under the media root.
    async fn supplied_media(&self, path: &Path) -> Media {
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Supplied media does not exist, discarding"
                );
                return Media::Done(FetchOutcome::MissingLocalFile);
            }
        };
        let inside = match tokio::fs::canonicalize(&self.media_root).await {
            Ok(root) => resolved.starts_with(&root),
            Err(e) => {
                warn!(root = %self.media_root.display(), error = %e, "Media root unavailable");
                false
            }
        };
        if !inside {
            warn!(
                path = %path.display(),
                root = %self.media_root.display(),
                "Supplied media is outside the media root, discarding"
            );
            return Media::Done(FetchOutcome::OutsideMediaRoot);
        }
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => {
                debug!(path = %resolved.display(), "Using supplied media");
                Media::Ready(resolved)
            }
            _ => {
                warn!(path = %path.display(), "Supplied media is not a regular file, discarding");
                Media::Done(FetchOutcome::MissingLocalFile)
            }
        }
    }

    fn fetch_failed(&self, event: &NotificationEvent, error: &str, attempts: u32) {
        warn!(attempts, error, url = %event.source_url, "Fetch failed");
        self.alerter.raise(
            AlertKind::FetchFailed,
            format!(
                "fetch of {} ({}) failed after {} attempt(s): {}",
                event.item_id, event.source_url, attempts, error
            ),
        );
    }
}

pub(crate) async fn remove_media(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Media deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete media"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::FetchError;
    use crate::pipeline::InFlightSet;
    use crate::test_utils::{FakeFetcher, FakeMetadata, test_stores};
    use crate::types::{ChannelId, ItemId, ItemKey, Platform};
    use chrono::TimeDelta;

    struct Harness {
        stage: FetchStage<FakeFetcher, FakeMetadata>,
        fetcher: FakeFetcher,
        metadata: FakeMetadata,
        stores: Arc<StateStores>,
        publish_queue: BoundedQueue<PublishTask>,
        alerts: tokio::sync::mpsc::Receiver<crate::alert::Alert>,
        inflight: InFlightSet,
        dir: tempfile::TempDir,
    }

    fn harness(publish_capacity: usize) -> Harness {
        let (stores, dir) = test_stores();
        let fetcher = FakeFetcher::new(dir.path().join("downloads"));
        let metadata = FakeMetadata::default();
        let publish_queue = BoundedQueue::new(publish_capacity);
        let (alerter, alerts) = Alerter::channel(16);
        let config = FetchStageConfig {
            filter: ItemFilter::default(),
            fetch_retry: RetryConfig::fixed(3, Duration::ZERO),
            metadata_retry: RetryConfig::fixed(2, Duration::ZERO),
        };
        let stage = FetchStage::new(
            fetcher.clone(),
            dir.path().join("downloads"),
            Some(metadata.clone()),
            Arc::clone(&stores),
            publish_queue.clone(),
            alerter,
            config,
        );
        Harness {
            stage,
            fetcher,
            metadata,
            stores,
            publish_queue,
            alerts,
            inflight: InFlightSet::new(),
            dir,
        }
    }

    fn task(h: &Harness, event: NotificationEvent) -> FetchTask {
        let claim = h.inflight.try_claim(event.key()).unwrap();
        FetchTask { event, claim }
    }

    fn yt_event(id: &str) -> NotificationEvent {
        NotificationEvent::youtube(ChannelId::new("UC1"), ItemId::new(id))
    }

    fn short(id: &str, age_secs: i64, duration_secs: u64) -> VideoMetadata {
        VideoMetadata {
            item_id: ItemId::new(id),
            channel_id: Some(ChannelId::new("UC1")),
            title: None,
            published_at: Utc::now() - TimeDelta::seconds(age_secs),
            duration: Some(Duration::from_secs(duration_secs)),
        }
    }

    #[test]
    fn filter_boundaries() {
        let filter = ItemFilter::default();
        let now = Utc::now();
        let meta = |age: i64, dur: u64| VideoMetadata {
            item_id: ItemId::new("a"),
            channel_id: None,
            title: None,
            published_at: now - TimeDelta::seconds(age),
            duration: Some(Duration::from_secs(dur)),
        };

        assert_eq!(filter.check(&meta(120, 60), false, now), Ok(()));
        assert!(matches!(
            filter.check(&meta(121, 30), false, now),
            Err(SkipReason::NotRecent { .. })
        ));
        assert_eq!(filter.check(&meta(3600, 30), true, now), Ok(()));
        assert_eq!(filter.check(&meta(-30, 30), false, now), Ok(()));
        assert!(matches!(
            filter.check(&meta(0, 61), false, now),
            Err(SkipReason::TooLong { .. })
        ));

        let mut unknown = meta(0, 0);
        unknown.duration = None;
        assert_eq!(filter.check(&unknown, false, now), Err(SkipReason::UnknownDuration));
    }

    #[tokio::test]
    async fn qualifying_item_is_fetched_and_queued() {
        let h = harness(5);
        h.metadata.insert(short("abc", 10, 30));

        let outcome = h.stage.process(task(&h, yt_event("abc")), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::Queued);
        assert_eq!(h.fetcher.calls(), vec![ItemId::new("abc")]);
        let queued = h.publish_queue.pop().await.unwrap();
        assert_eq!(queued.item_id, ItemId::new("abc"));
        assert!(queued.local_path.exists());
        assert!(h.inflight.contains(&queued.key()), "claim travels with the task");
    }

    #[tokio::test]
    async fn processed_item_is_discarded() {
        let h = harness(5);
        h.stores
            .history
            .record(&ItemKey::new(Platform::youtube(), ItemId::new("abc")))
            .unwrap();

        let outcome = h.stage.process(task(&h, yt_event("abc")), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::AlreadyProcessed);
        assert!(h.fetcher.calls().is_empty());
        assert!(h.inflight.is_empty());
    }

    #[tokio::test]
    async fn stale_or_long_items_are_skipped_without_alert() {
        let mut h = harness(5);
        h.metadata.insert(short("old", 600, 30));
        h.metadata.insert(short("long", 5, 600));

        let old = h.stage.process(task(&h, yt_event("old")), &CancellationToken::new()).await;
        let long = h.stage.process(task(&h, yt_event("long")), &CancellationToken::new()).await;

        assert!(matches!(old, FetchOutcome::Skipped(SkipReason::NotRecent { .. })));
        assert!(matches!(long, FetchOutcome::Skipped(SkipReason::TooLong { .. })));
        assert!(h.fetcher.calls().is_empty());
        assert!(h.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_youtube_item_skips_recency() {
        let h = harness(5);
        h.metadata.insert(short("old", 86_400, 30));
        let mut event = yt_event("old");
        event.manual = true;

        let outcome = h.stage.process(task(&h, event), &CancellationToken::new()).await;
        assert_eq!(outcome, FetchOutcome::Queued);
    }

    #[tokio::test]
    async fn unknown_metadata_is_discarded_without_alert() {
        let mut h = harness(5);
        let outcome = h.stage.process(task(&h, yt_event("ghost")), &CancellationToken::new()).await;
        assert_eq!(outcome, FetchOutcome::MetadataUnavailable);
        assert!(h.fetcher.calls().is_empty());
        assert_eq!(h.metadata.lookups().len(), 1, "not found is not retried");
        assert!(h.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn metadata_outage_alerts_after_retries() {
        let mut h = harness(5);
        h.metadata.set_outage(Some(503));

        let outcome = h.stage.process(task(&h, yt_event("abc")), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::MetadataUnavailable);
        assert_eq!(h.metadata.lookups().len(), 2);
        assert!(h.fetcher.calls().is_empty());
        let alert = h.alerts.try_recv().unwrap();
        assert_eq!(alert.kind, AlertKind::MetadataUnavailable);
        assert!(alert.message.contains("abc"));
        assert!(h.inflight.is_empty());
    }

    #[tokio::test]
    async fn fetch_retries_then_alerts() {
        let mut h = harness(5);
        h.metadata.insert(short("abc", 10, 30));
        h.fetcher.fail_next(3, || FetchError::Failed {
            status: "exit status: 1".into(),
            stderr: "HTTP Error 503".into(),
        });

        let outcome = h.stage.process(task(&h, yt_event("abc")), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::FetchFailed);
        assert_eq!(h.fetcher.calls().len(), 3);
        assert_eq!(h.alerts.recv().await.unwrap().kind, AlertKind::FetchFailed);
        assert!(h.inflight.is_empty(), "claim released on failure");
    }

    #[tokio::test]
    async fn transient_fetch_failure_recovers() {
        let h = harness(5);
        h.metadata.insert(short("abc", 10, 30));
        h.fetcher.fail_next(2, || FetchError::Timeout(Duration::from_secs(1)));

        let outcome = h.stage.process(task(&h, yt_event("abc")), &CancellationToken::new()).await;
        assert_eq!(outcome, FetchOutcome::Queued);
        assert_eq!(h.fetcher.calls().len(), 3);
    }

    fn supplied_event(id: &str, path: PathBuf) -> NotificationEvent {
        let mut event = NotificationEvent::youtube(ChannelId::new("tiktok"), ItemId::new(id));
        event.platform = Platform::new("tiktok");
        event.manual = true;
        event.local_path = Some(path);
        event
    }

    #[tokio::test]
    async fn local_path_hint_skips_fetcher() {
        let h = harness(5);
        let root = h.dir.path().join("downloads");
        std::fs::create_dir_all(&root).unwrap();
        let media = root.join("supplied.mp4");
        std::fs::write(&media, b"m").unwrap();
        let mut event = NotificationEvent::youtube(ChannelId::new("tiktok"), ItemId::new("1"));
        event.platform = Platform::new("tiktok");
        event.manual = true;
        event.local_path = Some(media.clone());

        let outcome = h.stage.process(task(&h, event), &CancellationToken::new()).await;

        assert_eq!(outcome, FetchOutcome::Queued);
        assert!(h.fetcher.calls().is_empty());
        let queued = h.publish_queue.pop().await.unwrap().local_path;
        assert_eq!(queued, std::fs::canonicalize(&media).unwrap());
    }

    #[tokio::test]
    async fn local_path_outside_media_root_is_refused() {
        let mut h = harness(1);
        std::fs::create_dir_all(h.dir.path().join("downloads")).unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let victims: Vec<PathBuf> = ["a.mp4", "b.mp4"]
            .iter()
            .map(|name| {
                let path = elsewhere.path().join(name);
                std::fs::write(&path, b"keep").unwrap();
                path
            })
            .collect();
        let token = CancellationToken::new();

        for (id, path) in ["1", "2"].iter().zip(&victims) {
            let outcome = h.stage.process(task(&h, supplied_event(id, path.clone())), &token).await;
            assert_eq!(outcome, FetchOutcome::OutsideMediaRoot);
        }

        assert!(victims.iter().all(|p| p.exists()), "files outside the root are untouched");
        assert!(h.publish_queue.is_empty());
        assert!(h.alerts.try_recv().is_err());
        assert!(h.inflight.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn traversal_out_of_media_root_is_refused() {
        let h = harness(5);
        let root = h.dir.path().join("downloads");
        std::fs::create_dir_all(&root).unwrap();
        let outside = h.dir.path().join("operator.db");
        std::fs::write(&outside, b"keep").unwrap();
        let link = root.join("link.mp4");
        std::os::unix::fs::symlink(&outside, &link).unwrap();
        let token = CancellationToken::new();

        let dotted = root.join("..").join("operator.db");
        let via_dots = h.stage.process(task(&h, supplied_event("1", dotted)), &token).await;
        let via_link = h.stage.process(task(&h, supplied_event("2", link)), &token).await;

        assert_eq!(via_dots, FetchOutcome::OutsideMediaRoot);
        assert_eq!(via_link, FetchOutcome::OutsideMediaRoot);
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn missing_local_file_is_discarded() {
        let h = harness(5);
        let mut event = yt_event("abc");
        event.platform = Platform::new("tiktok");
        event.local_path = Some(PathBuf::from("/nonexistent/media.mp4"));

        let outcome = h.stage.process(task(&h, event), &CancellationToken::new()).await;
        assert_eq!(outcome, FetchOutcome::MissingLocalFile);
    }

    #[tokio::test]
    async fn full_publish_queue_deletes_file_and_alerts() {
        let mut h = harness(1);
        h.metadata.insert(short("a", 10, 30));
        h.metadata.insert(short("b", 10, 30));

        let token = CancellationToken::new();
        assert_eq!(h.stage.process(task(&h, yt_event("a")), &token).await, FetchOutcome::Queued);
        assert_eq!(
            h.stage.process(task(&h, yt_event("b")), &token).await,
            FetchOutcome::PublishQueueFull
        );

        let dropped = h.fetcher.path_for(&ItemId::new("b"));
        assert!(!dropped.exists(), "media of the dropped item is deleted");
        let alert = h.alerts.recv().await.unwrap();
        assert_eq!(alert.kind, AlertKind::PublishQueueFull);
        assert!(alert.message.contains("capacity 1"));
        assert!(!h.inflight.contains(&yt_event("b").key()));
    }

    #[tokio::test]
    async fn shutdown_abandons_slow_fetch() {
        let h = harness(5);
        h.metadata.insert(short("abc", 10, 30));
        h.fetcher.set_delay(Duration::from_secs(30));
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.stage.process(task(&h, yt_event("abc")), &token),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, FetchOutcome::Abandoned);
        assert!(h.inflight.is_empty());
    }

    #[tokio::test]
    async fn non_youtube_items_skip_metadata() {
        let h = harness(5);
        let mut event = yt_event("7506491557038640406");
        event.platform = Platform::new("tiktok");
        event.manual = true;

        let outcome = h.stage.process(task(&h, event), &CancellationToken::new()).await;
        assert_eq!(outcome, FetchOutcome::Queued);
        assert!(h.metadata.lookups().is_empty());
    }
}
