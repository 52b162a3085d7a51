//! Process wiring: startup order and ordered shutdown.
//!
//! Startup: configuration is loaded and validated before anything else, then
//! state, alerts, the policy reloader, the exposure (tunnel or static URL),
//! the pipeline, admission and finally the HTTP server. Subscriptions are
//! reconciled only once the server answers its own `/health`, so the hub's
//! verification request can be answered.
//!
//! Shutdown: the root token stops admission, the server, both worker pools,
//! the renewal loop and the reloader. Queued forwards and alerts raised
//! meanwhile are flushed. The tunnel has its own token and is cancelled last.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionGate, FORWARD_QUEUE_CAPACITY, Forwarder, Intake};
use crate::alert::{ALERT_CHANNEL_CAPACITY, AlertDispatcher, Alerter, WeComSink};
use crate::collab::{CommandFetcher, CommandPublisher, YouTubeDataApi};
use crate::config::{self, ConfigError, ConfigReloader, Settings};
use crate::hub::{HttpHubClient, HubClient, Reconciler, RenewalLoop};
use crate::persistence::StateStores;
use crate::pipeline::{
    FetchStage, FetchStageConfig, ItemFilter, Pipeline, PipelineQueues, PublishStage,
};
use crate::retry::RetryConfig;
use crate::server::{AppState, build_router};
use crate::tunnel::{NgrokLauncher, Supervisor, TunnelSession};
use crate::types::ChannelId;

/// Loads the configuration at `config_path` and runs until shutdown.
pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let settings = config::load(&config_path)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    run_with(settings, Some(&config_path), shutdown_on_signal()).await
}

/// Runs with already validated settings until `shutdown` is cancelled.
///
/// `config_path`, when given, is watched for rate-limit changes.
pub async fn run_with(
    settings: Settings,
    config_path: Option<&Path>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tunnel_shutdown = CancellationToken::new();
    let alert_shutdown = CancellationToken::new();

    let stores = Arc::new(
        StateStores::open(&settings.state_dir)
            .with_context(|| format!("cannot open state in {}", settings.state_dir.display()))?,
    );
    info!(
        state_dir = %settings.state_dir.display(),
        processed = stores.history.len(),
        "State loaded"
    );

    let (alerter, alert_rx) = Alerter::channel(ALERT_CHANNEL_CAPACITY);
    let sink = settings
        .alert
        .wecom_webhook
        .as_deref()
        .map(WeComSink::new)
        .transpose()
        .context("cannot build alert client")?;
    let dispatcher = AlertDispatcher::new(alert_rx, sink, settings.alert.prefix.clone())
        .spawn(alert_shutdown.clone());

    let (policy_tx, policy_rx) = watch::channel(settings.rate_limit.policy()?);
    let reloader = match config_path {
        Some(path) => match ConfigReloader::new(path, policy_tx).spawn(shutdown.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Cannot watch config file, rate-limit hot reload disabled");
                None
            }
        },
        None => None,
    };

    // Exposure: a static public URL, or a supervised tunnel.
    let (session_tx, session_rx) = watch::channel::<Option<TunnelSession>>(None);
    let mut static_session = None;
    let supervisor = match (&settings.public_url, &settings.tunnel.program) {
        (Some(url), _) => {
            info!(public_url = %url, "Using static public URL");
            session_tx.send_replace(Some(TunnelSession::fixed(url.clone())));
            static_session = Some(session_tx);
            None
        }
        (None, Some(program)) => {
            let launcher = NgrokLauncher::new(
                program.clone(),
                settings.listen_addr.port(),
                settings.tunnel.api_url.clone(),
                settings.tunnel.authtoken.clone(),
                settings.tunnel.discovery_attempts,
                settings.tunnel.discovery_delay(),
            )
            .context("cannot build tunnel API client")?;
            let supervisor = Supervisor::new(
                launcher,
                settings.tunnel.check_interval(),
                settings.tunnel.min_restart_pause(),
                session_tx,
                alerter.clone(),
            );
            Some(supervisor.start(tunnel_shutdown.clone()).await)
        }
        (None, None) => {
            warn!("No public URL and no tunnel configured, hub subscriptions are disabled");
            static_session = Some(session_tx);
            None
        }
    };

    let hub = HttpHubClient::new(
        settings.hub.url.clone(),
        settings.hub.request_timeout(),
        settings.hub.secret.clone(),
        settings.hub.lease_seconds,
    )
    .context("cannot build hub client")?;
    let reconciler = Arc::new(Reconciler::new(
        hub,
        Arc::clone(&stores),
        alerter.clone(),
        RetryConfig::fixed(settings.hub.max_attempts, settings.hub.retry_delay()),
    ));

    let queues = PipelineQueues::new(
        settings.pipeline.fetch_queue_capacity,
        settings.pipeline.publish_queue_capacity,
    );
    let pipeline = start_pipeline(&settings, &queues, &stores, &alerter, &shutdown)?;

    let gate = AdmissionGate::open(
        Arc::clone(&stores),
        policy_rx,
        alerter.clone(),
        shutdown.clone(),
    )
    .context("cannot load admission timestamps")?;
    let forward = settings
        .forward
        .url
        .as_deref()
        .map(|url| Forwarder::channel(url, settings.forward.timeout(), FORWARD_QUEUE_CAPACITY))
        .transpose()
        .context("cannot build forward client")?;
    let (forwarder, forward_worker) = match forward {
        Some((forwarder, worker)) => (Some(forwarder), Some(worker.spawn(alert_shutdown.clone()))),
        None => (None, None),
    };
    let intake = Intake::new(gate, queues.clone(), Arc::clone(&stores), forwarder, alerter.clone());

    let app_state = AppState::new(
        intake,
        Arc::clone(&stores),
        session_rx.clone(),
        settings.hub.secret.clone(),
        settings.callback_path.clone(),
    );
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("cannot listen on {}", settings.listen_addr))?;
    let local_addr = listener.local_addr().context("cannot read listening address")?;
    info!(addr = %local_addr, callback_path = %settings.callback_path, "Listening");
    let readiness = Readiness::for_addr(local_addr).context("cannot build readiness client")?;

    let initial = spawn_initial_reconcile(
        Arc::clone(&reconciler),
        readiness,
        settings.desired_channels(),
        settings.callback_path.clone(),
        session_rx.clone(),
        shutdown.clone(),
    );
    let renewal = RenewalLoop::new(
        Arc::clone(&reconciler),
        settings.hub.renewal_interval(),
        settings.callback_path.clone(),
        session_rx,
    )
    .spawn(shutdown.clone());

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }

    info!("Shutting down");
    shutdown.cancel();
    pipeline.join().await;
    join_logged("initial reconcile", initial).await;
    join_logged("renewal", renewal).await;
    if let Some(task) = reloader {
        join_logged("config reloader", task).await;
    }

    alert_shutdown.cancel();
    if let Some(task) = forward_worker {
        join_logged("forward worker", task).await;
    }
    join_logged("alert dispatcher", dispatcher).await;

    tunnel_shutdown.cancel();
    if let Some(task) = supervisor {
        join_logged("tunnel supervisor", task).await;
    }
    drop(static_session);
    info!("Shutdown complete");

    served.context("HTTP server failed")
}

fn start_pipeline(
    settings: &Settings,
    queues: &PipelineQueues,
    stores: &Arc<StateStores>,
    alerter: &Alerter,
    shutdown: &CancellationToken,
) -> anyhow::Result<Pipeline> {
    let fetcher = CommandFetcher::new(
        settings.fetcher.program.clone(),
        settings.fetcher.args.clone(),
        settings.download_dir.clone(),
        settings.fetcher.timeout(),
    );
    let metadata = settings
        .youtube
        .api_key
        .as_deref()
        .map(|key| {
            YouTubeDataApi::new(
                settings.youtube.api_url.clone(),
                key,
                settings.youtube.proxy.as_deref(),
                settings.hub.request_timeout(),
            )
        })
        .transpose()
        .context("cannot build YouTube Data API client")?;
    if metadata.is_none() {
        warn!("No YouTube API key, recency and duration checks are skipped");
    }

    let program = settings
        .publisher
        .program
        .clone()
        .ok_or(ConfigError::Missing("publisher.program"))?;
    let publisher = CommandPublisher::new(
        program,
        settings.publisher.args.clone(),
        settings.publisher.timeout(),
    );

    let fetch = FetchStage::new(
        fetcher,
        settings.download_dir.clone(),
        metadata,
        Arc::clone(stores),
        queues.publish.clone(),
        alerter.clone(),
        FetchStageConfig {
            filter: ItemFilter {
                recent_window: settings.youtube.recent_window(),
                max_duration: settings.youtube.max_duration(),
            },
            fetch_retry: RetryConfig::fixed(
                settings.fetcher.max_attempts,
                settings.fetcher.retry_delay(),
            ),
            metadata_retry: RetryConfig::fixed(
                settings.youtube.max_attempts,
                settings.youtube.retry_delay(),
            ),
        },
    );
    let publish = PublishStage::new(publisher, Arc::clone(stores), alerter.clone());

    info!(
        fetch_workers = settings.pipeline.fetch_workers,
        publish_workers = settings.pipeline.publish_workers,
        fetch_queue_capacity = settings.pipeline.fetch_queue_capacity,
        publish_queue_capacity = settings.pipeline.publish_queue_capacity,
        "Starting pipeline"
    );
    Ok(Pipeline::start(
        queues.clone(),
        fetch,
        settings.pipeline.fetch_workers,
        publish,
        settings.pipeline.publish_workers,
        shutdown,
    ))
}

const READY_ATTEMPTS: u32 = 40;
const READY_DELAY: Duration = Duration::from_millis(250);

/// Polls the server's own health endpoint.
struct Readiness {
    client: reqwest::Client,
    url: String,
    attempts: u32,
    delay: Duration,
}

impl Readiness {
    fn new(url: impl Into<String>, attempts: u32, delay: Duration) -> Result<Self, reqwest::Error> {
        Ok(Readiness {
            client: reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?,
            url: url.into(),
            attempts,
            delay,
        })
    }

    /// Targets `/health` on `addr`, through loopback when bound to all interfaces.
    fn for_addr(addr: SocketAddr) -> Result<Self, reqwest::Error> {
        let ip = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let url = format!("http://{}/health", SocketAddr::new(ip, addr.port()));
        Readiness::new(url, READY_ATTEMPTS, READY_DELAY)
    }

    /// Returns true once the endpoint answers 2xx, false after the last attempt.
    async fn wait(&self) -> bool {
        for attempt in 1..=self.attempts {
            match self.client.get(&self.url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(attempt, url = %self.url, "Ingress ready");
                    return true;
                }
                Ok(response) => debug!(attempt, status = %response.status(), "Ingress not ready"),
                Err(e) => debug!(attempt, error = %e, "Ingress not ready"),
            }
            tokio::time::sleep(self.delay).await;
        }
        false
    }
}

/// Reconciles the configured channels once a public URL is known and the
/// ingress answers its health check.
fn spawn_initial_reconcile<H: HubClient>(
    reconciler: Arc<Reconciler<H>>,
    readiness: Readiness,
    desired: std::collections::BTreeSet<ChannelId>,
    callback_path: String,
    mut sessions: watch::Receiver<Option<TunnelSession>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let first_session = async {
            let session = sessions.wait_for(Option::is_some).await.ok()?;
            session.as_ref().map(|s| s.callback_url(&callback_path))
        };
        let callback_url = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            url = first_session => match url {
                Some(url) => url,
                None => {
                    info!("No public URL will be published, skipping reconciliation");
                    return;
                }
            },
        };

        let ready = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            ready = readiness.wait() => ready,
        };
        if !ready {
            error!(
                url = %readiness.url,
                attempts = readiness.attempts,
                "Ingress never became healthy, skipping reconciliation"
            );
            return;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            result = reconciler.reconcile(&desired, &callback_url) => match result {
                Ok(report) if !report.failed.is_empty() => {
                    warn!(failed = report.failed.len(), "Some hub requests failed");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reconciliation could not persist its result"),
            },
        }
    })
}

async fn join_logged(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(task = name, error = %e, "Task ended abnormally");
    }
}

/// A token cancelled on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
