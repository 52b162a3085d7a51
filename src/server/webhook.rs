//! Hub callback endpoint.
//!
//! `GET` answers the hub's verification of intent by echoing the challenge.
//! `POST` carries either an Atom delivery from the hub or a JSON manual
//! submission; each resulting event goes through [`Intake::submit`].
//!
//! [`Intake::submit`]: crate::admission::Intake::submit

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::admission::IntakeOutcome;
use crate::feed::{
    ParseError, SIGNATURE_HEADER, is_xml_payload, parse_atom, parse_manual, verify_signature,
};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing hub.challenge")]
    MissingChallenge,

    #[error("malformed notification: {0}")]
    Malformed(#[from] ParseError),

    #[error("shutting down")]
    ShuttingDown,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingChallenge => StatusCode::BAD_REQUEST,
            WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// Subscription verification.
///
/// ```ignore
/// GET /youtube/callback?hub.mode=subscribe&hub.topic=...&hub.challenge=abc HTTP/1.1
///
/// HTTP/1.1 200 OK
///
/// abc
/// ```
pub async fn verify_handler(
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, WebhookError> {
    let challenge = params
        .get("hub.challenge")
        .or_else(|| params.get("challenge"))
        .ok_or(WebhookError::MissingChallenge)?;
    info!(
        mode = params.get("hub.mode").map(String::as_str).unwrap_or("-"),
        topic = params.get("hub.topic").map(String::as_str).unwrap_or("-"),
        "Hub verification"
    );
    Ok(challenge.clone())
}

/// Notification delivery.
///
/// Responds with the admission outcome of the first event: `OK`,
/// `Duplicate`, `Rate limited`, `Channel disabled` or `Dropped`. A delivery
/// that carries no entries is acknowledged with `OK`.
pub async fn notify_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    if app_state.intake().gate().is_shutting_down() {
        return Err(WebhookError::ShuttingDown);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let events = if is_xml_payload(content_type, &body) {
        if let Some(secret) = app_state.hub_secret() {
            let signature = headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !verify_signature(&body, signature, secret) {
                // 2xx so the hub does not redeliver forged content.
                warn!(len = body.len(), "Dropping delivery with invalid signature");
                return Ok((StatusCode::OK, "OK"));
            }
        }
        let payload = parse_atom(&body).inspect_err(|e| {
            warn!(error = %e, len = body.len(), "Unparseable Atom delivery");
        })?;
        if payload.deleted > 0 {
            debug!(deleted = payload.deleted, "Ignoring deleted entries");
        }
        payload
            .entries
            .into_iter()
            .map(|entry| entry.into_event())
            .collect::<Vec<_>>()
    } else {
        let event = parse_manual(&body).inspect_err(|e| {
            warn!(error = %e, len = body.len(), "Unparseable manual submission");
        })?;
        vec![event]
    };

    let mut first = None;
    for event in events {
        let outcome = app_state.intake().submit(event).await;
        if outcome == IntakeOutcome::ShuttingDown {
            return Err(WebhookError::ShuttingDown);
        }
        first.get_or_insert(outcome);
    }
    Ok((
        StatusCode::OK,
        first.map_or(IntakeOutcome::Accepted.message(), |o| o.message()),
    ))
}
