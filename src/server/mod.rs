//! HTTP server.
//!
//! # Endpoints
//!
//! - `GET <callback_path>` - hub verification of intent (echoes the challenge)
//! - `POST <callback_path>` - hub deliveries and manual submissions
//! - `GET /status` - queue depths, subscriptions and the current public URL
//! - `GET /health` - returns 200 if the server is running

use std::sync::Arc;

use tokio::sync::watch;

use crate::admission::Intake;
use crate::persistence::StateStores;
use crate::tunnel::TunnelSession;

pub mod health;
pub mod status;
pub mod webhook;

pub use health::health_handler;
pub use status::{StatusReport, status_handler};
pub use webhook::{notify_handler, verify_handler};

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    intake: Intake,
    stores: Arc<StateStores>,
    session: watch::Receiver<Option<TunnelSession>>,

    /// Secret for `X-Hub-Signature` verification; `None` accepts unsigned
    /// deliveries.
    hub_secret: Option<Vec<u8>>,

    callback_path: String,
}

impl AppState {
    pub fn new(
        intake: Intake,
        stores: Arc<StateStores>,
        session: watch::Receiver<Option<TunnelSession>>,
        hub_secret: Option<impl Into<Vec<u8>>>,
        callback_path: impl Into<String>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                intake,
                stores,
                session,
                hub_secret: hub_secret.map(Into::into),
                callback_path: callback_path.into(),
            }),
        }
    }

    pub fn intake(&self) -> &Intake {
        &self.inner.intake
    }

    pub fn stores(&self) -> &StateStores {
        &self.inner.stores
    }

    pub fn hub_secret(&self) -> Option<&[u8]> {
        self.inner.hub_secret.as_deref()
    }

    pub fn callback_path(&self) -> &str {
        &self.inner.callback_path
    }

    /// The session currently published by the tunnel supervisor.
    pub fn session(&self) -> Option<TunnelSession> {
        self.inner.session.borrow().clone()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::get;

    let callback_path = app_state.callback_path().to_string();
    axum::Router::new()
        .route(&callback_path, get(verify_handler).post(notify_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
