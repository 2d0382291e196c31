//! Edge relay for browser streaming sessions.
//!
//! Public viewers connect with `?sessionId=…`; each admitted connection gets
//! its own websocket to the streaming host and frames are relayed verbatim in
//! both directions. A newer connection for the same id evicts the older one.

pub mod config;
pub mod link;
pub mod proxy;
pub mod registry;
pub mod telemetry;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use browser_proto::CLOSE_GOING_AWAY;
use metrics_exporter_prometheus::PrometheusHandle;
use std::{sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::RelayConfig, registry::RelayRegistry};

#[derive(Clone)]
pub struct RelayState {
    inner: Arc<Inner>,
}

struct Inner {
    registry: RelayRegistry,
    backend_url: String,
    backend_connect_timeout: Duration,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self::with_backend(config.backend_url(), config.backend_connect_timeout, metrics)
    }

    pub fn with_backend(
        backend_url: impl Into<String>,
        backend_connect_timeout: Duration,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RelayRegistry::new(),
                backend_url: backend_url.into(),
                backend_connect_timeout,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.inner.registry
    }

    pub fn backend_url(&self) -> &str {
        &self.inner.backend_url
    }

    pub fn backend_connect_timeout(&self) -> Duration {
        self.inner.backend_connect_timeout
    }

    /// Closes every admitted client and its backend link.
    pub fn shutdown(&self) {
        let sessions = self.inner.registry.drain();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing relayed sessions");
        }
        for session in sessions {
            session.client.close(CLOSE_GOING_AWAY, "Server shutting down");
            session.backend.close(CLOSE_GOING_AWAY, "Server shutting down");
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(proxy::ws_handler))
        .route("/ws", get(proxy::ws_handler))
        .route("/health", get(proxy::health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let body = state
        .inner
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
