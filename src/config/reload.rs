//! Hot reload of the `[rate_limit]` section.
//!
//! The config file's parent directory is watched (editors often replace a
//! file by rename, which a watch on the file itself would miss). Events for
//! the config file wake an async task that re-reads it, rebuilds the
//! [`RateLimitPolicy`] and publishes it wholesale with `send_replace`.
//! Readers therefore always see one complete policy, old or new.
//!
//! A file that fails to read, parse or validate leaves the current policy in
//! place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigError, Settings};
use crate::admission::policy::RateLimitPolicy;

/// Quiet period after a filesystem event before the file is re-read.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Reads the config file and derives the rate-limit policy from it.
pub fn read_policy(path: &Path) -> Result<RateLimitPolicy, ConfigError> {
    Settings::from_file(path)?.rate_limit.policy()
}

pub struct ConfigReloader {
    path: PathBuf,
    policy_tx: watch::Sender<RateLimitPolicy>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, policy_tx: watch::Sender<RateLimitPolicy>) -> Self {
        ConfigReloader {
            path: path.into(),
            policy_tx,
        }
    }

    /// Re-reads the file once and publishes the result if it changed.
    ///
    /// Returns `Ok(true)` if a new policy was published.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let policy = read_policy(&self.path)?;
        let changed = self.policy_tx.send_if_modified(|current| {
            if *current == policy {
                false
            } else {
                *current = policy;
                true
            }
        });
        if changed {
            let current = self.policy_tx.borrow();
            info!(
                path = %self.path.display(),
                default_interval_secs = current.default_interval().as_secs(),
                "Rate-limit policy reloaded"
            );
        }
        Ok(changed)
    }

    /// Starts watching the file. The returned task exits on shutdown.
    pub fn spawn(self, shutdown: CancellationToken) -> notify::Result<JoinHandle<()>> {
        let (event_tx, event_rx) = mpsc::channel::<()>(8);
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        // A full channel already has a wakeup pending.
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "Config watcher error"),
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "Watching config for rate-limit changes");

        Ok(tokio::spawn(self.run(watcher, event_rx, shutdown)))
    }

    async fn run(
        self,
        watcher: RecommendedWatcher,
        mut events: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        // Dropping the watcher stops notifications.
        let _watcher = watcher;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Config reloader shutting down");
                    return;
                }
                event = events.recv() => {
                    if event.is_none() {
                        return;
                    }
                    tokio::time::sleep(SETTLE_DELAY).await;
                    while events.try_recv().is_ok() {}

                    if let Err(e) = self.reload() {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Config reload failed, keeping previous rate-limit policy"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::policy::{AdmissionRule, ChannelOverride};
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn write_config(path: &Path, minutes: u64) {
        std::fs::write(
            path,
            format!(
                "[rate_limit]\ndefault_interval_minutes = {}\n\n[publisher]\nprogram = \"up\"\n",
                minutes
            ),
        )
        .unwrap();
    }

    #[test]
    fn reload_publishes_changed_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crosspost.toml");
        write_config(&path, 60);

        let (tx, rx) = watch::channel(RateLimitPolicy::default());
        let reloader = ConfigReloader::new(&path, tx);

        assert!(!reloader.reload().unwrap(), "same policy is not republished");

        write_config(&path, 15);
        assert!(reloader.reload().unwrap());
        assert_eq!(rx.borrow().default_interval(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn broken_file_keeps_previous_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crosspost.toml");
        std::fs::write(&path, "[rate_limit\n").unwrap();

        let initial = RateLimitPolicy::default().with_override("UC1", ChannelOverride::Disabled);
        let (tx, rx) = watch::channel(initial.clone());
        let reloader = ConfigReloader::new(&path, tx);

        assert!(matches!(reloader.reload(), Err(ConfigError::Parse { .. })));
        assert_eq!(*rx.borrow(), initial);
    }

    #[tokio::test]
    async fn watcher_picks_up_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crosspost.toml");
        write_config(&path, 60);

        let (tx, mut rx) = watch::channel(RateLimitPolicy::default());
        let shutdown = CancellationToken::new();
        let handle = ConfigReloader::new(&path, tx).spawn(shutdown.clone()).unwrap();

        // Give the backend a moment to register the watch.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_config(&path, 5);

        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .expect("policy should be republished")
            .unwrap();
        assert_eq!(
            rx.borrow().rule_for(&"UCany".into()),
            AdmissionRule::Interval(TimeDelta::minutes(5))
        );

        shutdown.cancel();
        handle.await.unwrap();
    }
}
