//! Read-only status endpoint.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use super::AppState;
use crate::persistence::StoreError;
use crate::pipeline::QueueDepths;
use crate::tunnel::TunnelSession;
use crate::types::ChannelId;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("state error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queues: QueueDepths,
    pub subscribed: BTreeSet<ChannelId>,
    pub processed: usize,
    pub public_url: Option<String>,
    pub tunnel: Option<TunnelSession>,
    pub shutting_down: bool,
}

/// ```ignore
/// GET /status HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {"queues":{"fetch":0,"fetch_capacity":16,...},"subscribed":["UC..."],...}
/// ```
pub async fn status_handler(
    State(app_state): State<AppState>,
) -> Result<Json<StatusReport>, StatusError> {
    let stores = app_state.stores();
    let tunnel = app_state.session();
    Ok(Json(StatusReport {
        queues: app_state.intake().queues().depths(),
        subscribed: stores.subscriptions.load()?,
        processed: stores.history.len(),
        public_url: tunnel.as_ref().map(|s| s.public_url.clone()),
        tunnel,
        shutting_down: app_state.intake().gate().is_shutting_down(),
    }))
}
