//! Shared test fakes and arbitrary generators for property-based testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use tempfile::TempDir;

use crate::collab::{
    FetchError, Fetcher, MetadataError, MetadataSource, PublishError, Publisher, VideoMetadata,
};
use crate::hub::{HubClient, HubError, HubMode};
use crate::persistence::StateStores;
use crate::tunnel::{TunnelError, TunnelLauncher, TunnelProcess};
use crate::types::{ChannelId, ItemId, ItemKey, Platform, PublishTask};

pub fn arb_channel_id() -> impl Strategy<Value = ChannelId> {
    "UC[A-Za-z0-9_-]{22}".prop_map(ChannelId::new)
}

pub fn arb_item_id() -> impl Strategy<Value = ItemId> {
    "[A-Za-z0-9_-]{11}".prop_map(ItemId::new)
}

pub fn arb_item_key() -> impl Strategy<Value = ItemKey> {
    (
        prop_oneof![Just("youtube"), Just("tiktok"), Just("instagram")],
        arb_item_id(),
    )
        .prop_map(|(platform, item)| ItemKey::new(Platform::new(platform), item))
}

/// Fresh stores in a temporary directory. Keep the `TempDir` alive.
pub fn test_stores() -> (Arc<StateStores>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let stores = StateStores::open(&dir.path().join("state")).unwrap();
    (Arc::new(stores), dir)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Hub ────────────────────────────────────────────────────────────────────

/// Records every request and fails selected channels a fixed number of times.
#[derive(Debug, Clone, Default)]
pub struct FakeHub {
    calls: Arc<Mutex<Vec<(HubMode, ChannelId, String)>>>,
    failures: Arc<Mutex<HashMap<ChannelId, (u32, u16)>>>,
}

impl FakeHub {
    pub fn calls(&self) -> Vec<(HubMode, ChannelId, String)> {
        lock(&self.calls).clone()
    }

    /// The next `times` requests for `channel` answer `status`.
    pub fn fail_channel(&self, channel: &str, times: u32, status: u16) {
        lock(&self.failures).insert(ChannelId::new(channel), (times, status));
    }

    pub fn attempts_for(&self, channel: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(_, ch, _)| ch.as_str() == channel)
            .count()
    }
}

impl HubClient for FakeHub {
    async fn request(
        &self,
        mode: HubMode,
        channel: &ChannelId,
        callback_url: &str,
    ) -> Result<(), HubError> {
        lock(&self.calls).push((mode, channel.clone(), callback_url.to_string()));
        let mut failures = lock(&self.failures);
        if let Some((remaining, status)) = failures.get_mut(channel)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(HubError::unexpected_status(*status, "injected failure"));
        }
        Ok(())
    }
}

// ─── Tunnel ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LauncherState {
    attempts: u32,
    failures_left: u32,
    terminated: u32,
    current: Option<Arc<AtomicBool>>,
}

/// Launches fake processes with URLs `https://tunnel-N.example`, N counting
/// every launch attempt.
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn launches(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn terminated(&self) -> u32 {
        lock(&self.state).terminated
    }

    pub fn fail_next(&self, times: u32) {
        lock(&self.state).failures_left = times;
    }

    /// Marks the most recently launched process as exited.
    pub fn kill_current(&self) {
        if let Some(exited) = &lock(&self.state).current {
            exited.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    id: u32,
    exited: Arc<AtomicBool>,
    state: Arc<Mutex<LauncherState>>,
}

impl TunnelProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.id)
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn terminate(self) {
        self.exited.store(true, Ordering::SeqCst);
        lock(&self.state).terminated += 1;
    }
}

impl TunnelLauncher for FakeLauncher {
    type Process = FakeProcess;

    async fn prepare(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn launch(&self) -> Result<(FakeProcess, String), TunnelError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TunnelError::Discovery { attempts: 1 });
        }
        let exited = Arc::new(AtomicBool::new(false));
        state.current = Some(Arc::clone(&exited));
        let id = state.attempts;
        let process = FakeProcess {
            id,
            exited,
            state: Arc::clone(&self.state),
        };
        Ok((process, format!("https://tunnel-{}.example", id)))
    }
}

// ─── Pipeline collaborators ─────────────────────────────────────────────────

type FailureFactory = Box<dyn Fn() -> FetchError + Send + Sync>;

#[derive(Default)]
struct FetcherState {
    calls: Vec<ItemId>,
    failures_left: u32,
    failure: Option<FailureFactory>,
    delay: Duration,
}

/// Writes a small file per item under `root` after an optional delay.
#[derive(Clone)]
pub struct FakeFetcher {
    root: PathBuf,
    state: Arc<Mutex<FetcherState>>,
}

impl FakeFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FakeFetcher {
            root: root.into(),
            state: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<ItemId> {
        lock(&self.state).calls.clone()
    }

    pub fn fail_next(&self, times: u32, error: impl Fn() -> FetchError + Send + Sync + 'static) {
        let mut state = lock(&self.state);
        state.failures_left = times;
        state.failure = Some(Box::new(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn path_for(&self, item: &ItemId) -> PathBuf {
        self.root.join(format!("{}.mp4", item))
    }
}

impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        _channel: &ChannelId,
        _url: &str,
        item: &ItemId,
    ) -> Result<PathBuf, FetchError> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push(item.clone());
            if state.failures_left > 0 {
                state.failures_left -= 1;
                if let Some(failure) = &state.failure {
                    return Err(failure());
                }
            }
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let path = self.path_for(item);
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, b"media").await?;
        Ok(path)
    }
}

/// Serves metadata for inserted items; everything else is `NotFound`.
#[derive(Debug, Clone, Default)]
pub struct FakeMetadata {
    items: Arc<Mutex<HashMap<ItemId, VideoMetadata>>>,
    lookups: Arc<Mutex<Vec<ItemId>>>,
    outage: Arc<Mutex<Option<u16>>>,
}

impl FakeMetadata {
    pub fn insert(&self, meta: VideoMetadata) {
        lock(&self.items).insert(meta.item_id.clone(), meta);
    }

    pub fn lookups(&self) -> Vec<ItemId> {
        lock(&self.lookups).clone()
    }

    /// Every lookup answers with `status` until cleared with `None`.
    pub fn set_outage(&self, status: Option<u16>) {
        *lock(&self.outage) = status;
    }
}

impl MetadataSource for FakeMetadata {
    async fn video_metadata(&self, item: &ItemId) -> Result<VideoMetadata, MetadataError> {
        lock(&self.lookups).push(item.clone());
        if let Some(status) = *lock(&self.outage) {
            return Err(MetadataError::Status(status));
        }
        lock(&self.items)
            .get(item)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(item.clone()))
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<ItemId>,
    fail_all: bool,
    delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FakePublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<ItemId> {
        lock(&self.state).published.clone()
    }

    pub fn fail_all(&self, fail: bool) {
        lock(&self.state).fail_all = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }
}

impl Publisher for FakePublisher {
    async fn publish(&self, _path: &Path, task: &PublishTask) -> Result<(), PublishError> {
        let (delay, fail) = {
            let state = lock(&self.state);
            (state.delay, state.fail_all)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(PublishError::Rejected("injected failure".to_string()));
        }
        lock(&self.state).published.push(task.item_id.clone());
        Ok(())
    }
}
