//! Launching the tunnel process and discovering its public URL.
//!
//! The production launcher drives ngrok: `ngrok http <port>` is spawned and
//! the public URL is read from the agent's local API
//! (`http://127.0.0.1:4040/api/tunnels`), polled until a tunnel appears.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::TunnelError;

/// Grace period between SIGKILL and giving up on reaping the child.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running tunnel process.
pub trait TunnelProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn has_exited(&mut self) -> bool;

    fn terminate(self) -> impl Future<Output = ()> + Send;
}

pub trait TunnelLauncher: Send + Sync + 'static {
    type Process: TunnelProcess;

    /// One-time setup before the first launch.
    fn prepare(&self) -> impl Future<Output = Result<(), TunnelError>> + Send;

    /// Starts the tunnel and returns it with its public base URL.
    fn launch(&self) -> impl Future<Output = Result<(Self::Process, String), TunnelError>> + Send;
}

/// Wrapper around the spawned child.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl TunnelProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                warn!(%status, "Tunnel process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Cannot poll tunnel process, treating it as exited");
                true
            }
        }
    }

    async fn terminate(mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            debug!(?pid, error = %e, "Tunnel process already gone");
        }
        match tokio::time::timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(?pid, %status, "Tunnel process terminated"),
            Ok(Err(e)) => warn!(?pid, error = %e, "Failed to reap tunnel process"),
            Err(_) => warn!(?pid, "Tunnel process did not exit in time"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    public_url: String,
    #[serde(default)]
    proto: String,
}

/// Picks the public URL from the agent API response, preferring https.
fn select_public_url(list: TunnelList) -> Option<String> {
    let mut fallback = None;
    for tunnel in list.tunnels {
        if tunnel.proto == "https" || tunnel.public_url.starts_with("https://") {
            return Some(tunnel.public_url);
        }
        fallback.get_or_insert(tunnel.public_url);
    }
    fallback
}

#[derive(Debug, Clone)]
pub struct NgrokLauncher {
    program: String,
    port: u16,
    api_url: String,
    authtoken: Option<String>,
    discovery_attempts: u32,
    discovery_delay: Duration,
    client: reqwest::Client,
}

impl NgrokLauncher {
    pub fn new(
        program: impl Into<String>,
        port: u16,
        api_url: impl Into<String>,
        authtoken: Option<String>,
        discovery_attempts: u32,
        discovery_delay: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(NgrokLauncher {
            program: program.into(),
            port,
            api_url: api_url.into(),
            authtoken,
            discovery_attempts: discovery_attempts.max(1),
            discovery_delay,
            client,
        })
    }

    async fn discover(&self) -> Option<String> {
        for attempt in 1..=self.discovery_attempts {
            tokio::time::sleep(self.discovery_delay).await;
            match self.client.get(&self.api_url).send().await {
                Ok(response) => match response.json::<TunnelList>().await {
                    Ok(list) => {
                        if let Some(url) = select_public_url(list) {
                            return Some(url);
                        }
                    }
                    Err(e) => debug!(attempt, error = %e, "Unexpected tunnel API response"),
                },
                Err(e) => debug!(attempt, error = %e, "Tunnel API not ready"),
            }
        }
        None
    }
}

impl TunnelLauncher for NgrokLauncher {
    type Process = ChildProcess;

    async fn prepare(&self) -> Result<(), TunnelError> {
        let Some(token) = &self.authtoken else {
            return Ok(());
        };
        let status = Command::new(&self.program)
            .args(["config", "add-authtoken", token])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(TunnelError::Spawn)?;
        if !status.success() {
            return Err(TunnelError::Setup(format!("add-authtoken exited with {}", status)));
        }
        info!("Tunnel auth token configured");
        Ok(())
    }

    async fn launch(&self) -> Result<(ChildProcess, String), TunnelError> {
        let child = Command::new(&self.program)
            .args(["http", &self.port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;
        let mut process = ChildProcess { child };
        info!(pid = ?process.id(), port = self.port, "Tunnel process started");

        let discovered = self.discover().await;
        let alive = !process.has_exited();
        match discovered {
            Some(url) if alive => Ok((process, url)),
            _ => {
                let attempts = self.discovery_attempts;
                process.terminate().await;
                Err(TunnelError::Discovery { attempts })
            }
        }
    }
}
