use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{host::StreamingHost, viewer::ViewerHandle};

#[derive(Clone)]
pub struct AppState {
    pub host: StreamingHost,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "browser-host",
        "activeSessions": state.host.active_sessions(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.host))
}

async fn handle_socket(socket: WebSocket, host: StreamingHost) {
    let (viewer, mut outbound) = ViewerHandle::channel(host.frame_buffer());
    let (mut sender, mut receiver) = socket.split();
    counter!("browser_host_viewer_connections_total", 1);
    info!(viewer = %viewer.id(), "viewer connected");

    let viewer_id = viewer.id();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(viewer = %viewer_id, error = %err, "failed to encode host message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(viewer = %viewer_id, "viewer writer finished");
    });

    // start-streaming may spend several seconds in discovery; it runs beside
    // the reader so stop/control/input keep flowing meanwhile.
    let mut starts = JoinSet::new();
    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(viewer = %viewer.id(), error = %err, "viewer socket error");
                        break;
                    }
                };
                let Some(message) = host.decode(&viewer, &text).await else {
                    continue;
                };
                if matches!(message, browser_proto::ViewerMessage::StartStreaming { .. }) {
                    let host = host.clone();
                    let viewer = viewer.clone();
                    starts.spawn(async move { host.handle_message(&viewer, message).await });
                } else {
                    host.handle_message(&viewer, message).await;
                }
            }
            Some(_) = starts.join_next(), if !starts.is_empty() => {}
        }
    }

    starts.shutdown().await;
    writer.abort();
    host.viewer_disconnected(&viewer).await;
    info!(viewer = %viewer.id(), "viewer disconnected");
}
