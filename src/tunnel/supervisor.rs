//! Tunnel supervision.
//!
//! The supervisor owns the tunnel process. Every `check_interval` it polls
//! process liveness; a dead process is relaunched, with at least
//! `min_restart_pause` between two launch attempts so a tunnel that dies on
//! startup cannot spin. The current [`TunnelSession`] is published through a
//! watch channel with `send_replace`: readers see the previous session until
//! the replacement is complete.
//!
//! The supervisor has its own shutdown token. The application cancels it
//! after every other task has stopped, so the tunnel is the last thing torn
//! down.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::launcher::{TunnelLauncher, TunnelProcess};
use super::session::TunnelSession;
use crate::alert::{AlertKind, Alerter};

pub struct Supervisor<L: TunnelLauncher> {
    launcher: L,
    check_interval: Duration,
    min_restart_pause: Duration,
    sessions: watch::Sender<Option<TunnelSession>>,
    alerter: Alerter,
    process: Option<L::Process>,
    last_attempt: Option<Instant>,
    restarts: u64,
}

impl<L: TunnelLauncher> Supervisor<L> {
    pub fn new(
        launcher: L,
        check_interval: Duration,
        min_restart_pause: Duration,
        sessions: watch::Sender<Option<TunnelSession>>,
        alerter: Alerter,
    ) -> Self {
        Supervisor {
            launcher,
            check_interval,
            min_restart_pause,
            sessions,
            alerter,
            process: None,
            last_attempt: None,
            restarts: 0,
        }
    }

    /// Prepares the launcher, makes a first launch attempt and spawns the
    /// monitor loop. A failed first launch is retried by the loop.
    pub async fn start(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        if let Err(e) = self.launcher.prepare().await {
            warn!(error = %e, "Tunnel preparation failed");
            self.alerter
                .raise(AlertKind::Tunnel, format!("tunnel preparation failed: {}", e));
        }
        self.try_launch().await;
        tokio::spawn(self.run(shutdown))
    }

    async fn try_launch(&mut self) -> bool {
        self.last_attempt = Some(Instant::now());
        match self.launcher.launch().await {
            Ok((process, url)) => {
                let session = TunnelSession::new(process.id(), url);
                info!(
                    pid = ?session.pid,
                    public_url = %session.public_url,
                    "Tunnel session established"
                );
                self.process = Some(process);
                self.sessions.send_replace(Some(session));
                true
            }
            Err(e) => {
                warn!(error = %e, "Tunnel launch failed");
                self.alerter
                    .raise(AlertKind::Tunnel, format!("tunnel launch failed: {}", e));
                false
            }
        }
    }

    /// Runs one liveness check, relaunching if needed.
    async fn check(&mut self) {
        if let Some(process) = self.process.as_mut()
            && process.has_exited()
        {
            self.process = None;
            self.alerter
                .raise(AlertKind::Tunnel, "tunnel process exited, restarting");
        }

        if self.process.is_some() {
            return;
        }

        if let Some(last) = self.last_attempt {
            let since = last.elapsed();
            if since < self.min_restart_pause {
                debug!(
                    wait_ms = (self.min_restart_pause - since).as_millis() as u64,
                    "Restart pause not yet elapsed"
                );
                return;
            }
        }

        self.restarts += 1;
        info!(restarts = self.restarts, "Restarting tunnel");
        self.try_launch().await;
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the launch just happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check().await,
            }
        }

        if let Some(process) = self.process.take() {
            info!(pid = ?process.id(), "Terminating tunnel");
            process.terminate().await;
        }
    }
}
