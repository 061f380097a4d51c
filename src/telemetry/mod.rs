//! Telemetry ingest: per-session tokens and the OTLP HTTP endpoint.

/// Key-event derivation from OTLP payloads.
pub mod keyevents;
/// OTLP JSON payload types.
pub mod otlp;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::status::StatusDeriver;

/// Per-session telemetry tokens, minted at PTY start.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: DashMap<String, String>,
}

impl TokenRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token for a session.
    #[must_use]
    pub fn mint(&self, session_id: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(token.clone(), session_id.to_string());
        token
    }

    /// Resolve a token to its session.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|s| s.value().clone())
    }

    /// Drop every token minted for a session.
    pub fn revoke_session(&self, session_id: &str) {
        self.tokens.retain(|_, v| v != session_id);
    }
}

/// Shared state for the ingest routes.
#[derive(Clone)]
pub struct IngestState {
    /// Token→session mapping.
    pub tokens: Arc<TokenRegistry>,

    /// Status deriver fed by parsed events.
    pub deriver: Arc<StatusDeriver>,
}

/// Build the ingest router.
pub fn ingest_router(state: IngestState) -> Router {
    Router::new()
        .route("/v1/logs/{token}", post(ingest_logs))
        .route("/v1/metrics/{token}", post(ingest_metrics))
        .route("/v1/traces/{token}", post(ingest_traces))
        .with_state(state)
}

/// Serve the ingest router on `addr` until the token is cancelled.
/// Returns the bound address.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(
    state: IngestState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Telemetry ingest listening");

    let app = ingest_router(state);
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "Telemetry ingest server exited");
        }
    });
    Ok((local_addr, handle))
}

/// Advertised base URL for an ingest address (IPv6 bracketed).
#[must_use]
pub fn base_url(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("http://{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("http://[{}]:{}", v6.ip(), v6.port()),
    }
}

async fn ingest_logs(
    State(state): State<IngestState>,
    Path(token): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some(session_id) = state.tokens.resolve(&token) else {
        return StatusCode::NOT_FOUND;
    };
    let payload: otlp::LogsPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, session_id, "Rejecting malformed OTLP logs body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let events = keyevents::events_from_logs(&payload);
    apply_events(&state, &session_id, events).await
}

async fn ingest_metrics(
    State(state): State<IngestState>,
    Path(token): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some(session_id) = state.tokens.resolve(&token) else {
        return StatusCode::NOT_FOUND;
    };
    let payload: otlp::MetricsPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, session_id, "Rejecting malformed OTLP metrics body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let events = keyevents::events_from_metrics(&payload);
    apply_events(&state, &session_id, events).await
}

async fn ingest_traces(
    State(state): State<IngestState>,
    Path(token): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some(session_id) = state.tokens.resolve(&token) else {
        return StatusCode::NOT_FOUND;
    };
    let payload: otlp::TracesPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, session_id, "Rejecting malformed OTLP traces body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let events = keyevents::events_from_traces(&payload);
    apply_events(&state, &session_id, events).await
}

async fn apply_events(
    state: &IngestState,
    session_id: &str,
    events: Vec<crate::core::KeyEvent>,
) -> StatusCode {
    for event in events {
        let prompt = keyevents::extract_prompt(&event);
        let observed_at = event.observed_at;

        if let Err(e) = state.deriver.apply_key_event(session_id, event).await {
            tracing::error!(error = %e, session_id, "Failed to apply telemetry event");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        if let Some(text) = prompt {
            if let Err(e) = state.deriver.apply_prompt(session_id, text, observed_at).await {
                tracing::error!(error = %e, session_id, "Failed to emit prompt event");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_registry_mints_and_resolves() {
        let registry = TokenRegistry::new();
        let token = registry.mint("conversation-1");
        assert_eq!(registry.resolve(&token).as_deref(), Some("conversation-1"));
        assert!(registry.resolve("unknown").is_none());

        registry.revoke_session("conversation-1");
        assert!(registry.resolve(&token).is_none());
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        let v4: SocketAddr = "127.0.0.1:4318".parse().unwrap();
        assert_eq!(base_url(v4), "http://127.0.0.1:4318");
        let v6: SocketAddr = "[::1]:4318".parse().unwrap();
        assert_eq!(base_url(v6), "http://[::1]:4318");
    }
}
