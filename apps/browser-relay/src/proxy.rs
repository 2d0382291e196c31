//! Websocket relay between public clients and the streaming host.
//!
//! A connection is admitted into the registry before its backend socket
//! exists, and the client is not read until that handshake resolves. Each
//! socket sink is owned by a writer task fed through its [`Link`], so
//! eviction, shutdown, and the forwarding paths never touch a sink directly.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use browser_proto::{CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use std::{borrow::Cow, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame as BackendCloseFrame},
        Message as BackendMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, field, info, info_span, instrument, warn, Instrument, Span};

use crate::{
    link::{Link, LinkCommand},
    registry::RelaySession,
    RelayState,
};

pub const MISSING_SESSION_REASON: &str = "sessionId query parameter is required";
pub const BACKEND_GONE_REASON: &str = "Streaming backend disconnected";
pub const BACKEND_UNAVAILABLE_REASON: &str = "Streaming backend unavailable";

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Upgrades websocket requests; a plain GET gets the health document.
pub async fn ws_handler(
    State(state): State<RelayState>,
    Query(query): Query<ConnectQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return health_handler(State(state)).await.into_response();
    };
    let session_id = query
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    ws.on_upgrade(move |socket| async move {
        match session_id {
            Some(session_id) => relay_connection(socket, session_id, state).await,
            None => reject(socket).await,
        }
    })
}

pub async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "browser-relay",
        "backend": state.backend_url(),
        "activeSessions": state.registry().len(),
    }))
}

async fn reject(mut socket: WebSocket) {
    warn!("rejecting connection without sessionId");
    counter!("browser_relay_sessions_rejected_total", 1);
    let _ = socket
        .send(Message::Close(Some(client_close_frame(
            CLOSE_POLICY_VIOLATION,
            MISSING_SESSION_REASON.to_string(),
        ))))
        .await;
}

#[instrument(
    name = "relay.connection",
    skip_all,
    fields(session_id = %session_id, client = field::Empty)
)]
async fn relay_connection(socket: WebSocket, session_id: String, state: RelayState) {
    let (client, client_commands) = Link::new();
    client.mark_open();
    let (backend, backend_commands) = Link::new();
    let client_id = client.id();
    Span::current().record("client", field::display(client_id));
    let session = Arc::new(RelaySession::new(
        session_id.clone(),
        client.clone(),
        backend.clone(),
    ));
    state.registry().admit(session);
    info!("client admitted");

    let (client_sink, mut client_source) = socket.split();
    let mut client_writer =
        tokio::spawn(write_client(client_sink, client_commands).in_current_span());

    let backend_url = state.backend_url().to_string();
    let connect = timeout(state.backend_connect_timeout(), connect_async(backend_url.as_str()))
        .instrument(info_span!("relay.backend_connect", backend = %backend_url))
        .await;
    let backend_socket = match connect {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(err)) => {
            warn!(backend = %backend_url, error = %err, "backend connect failed");
            abandon(&state, &session_id, &client, &backend, client_writer).await;
            return;
        }
        Err(_) => {
            warn!(backend = %backend_url, "backend connect timed out");
            abandon(&state, &session_id, &client, &backend, client_writer).await;
            return;
        }
    };

    if !backend.mark_open() {
        // Evicted or closed while the handshake was in flight.
        debug!("backend ready after connection was closed");
        let mut backend_socket = backend_socket;
        let _ = backend_socket.close(None).await;
        backend.mark_closed();
        let _ = client_writer.await;
        return;
    }
    debug!(backend = %backend_url, "backend connected");

    let (backend_sink, mut backend_source) = backend_socket.split();
    tokio::spawn(write_backend(backend_sink, backend_commands).in_current_span());

    {
        let client = client.clone();
        let backend = backend.clone();
        tokio::spawn(
            async move {
                while let Some(frame) = backend_source.next().await {
                    let text = match frame {
                        Ok(BackendMessage::Text(text)) => text,
                        Ok(BackendMessage::Binary(bytes)) => {
                            String::from_utf8_lossy(&bytes).into_owned()
                        }
                        Ok(BackendMessage::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            debug!(error = %err, "backend socket error");
                            break;
                        }
                    };
                    if client.send_text(text) {
                        counter!("browser_relay_messages_forwarded_total", 1, "direction" => "backend_to_client");
                    }
                }
                backend.mark_closed();
                if client.close(CLOSE_NORMAL, BACKEND_GONE_REASON) {
                    info!("backend disconnected; closing client");
                }
            }
            .in_current_span(),
        );
    }

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = client_source.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(error = %err, "client socket error");
                        break;
                    }
                };
                if backend.send_text(text) {
                    counter!("browser_relay_messages_forwarded_total", 1, "direction" => "client_to_backend");
                }
            }
            _ = &mut client_writer, if !writer_done => {
                // The writer only stops after sending a close frame or losing
                // the socket; either way this client is finished.
                writer_done = true;
                break;
            }
        }
    }

    client.mark_closed();
    state.registry().remove_if_client(&session_id, client_id);
    backend.close(CLOSE_NORMAL, "Client disconnected");
    if !writer_done {
        client_writer.abort();
    }
    info!("client disconnected");
}

/// Backend never came up: drop the entry if it is still ours and close the
/// client with an internal error.
async fn abandon(
    state: &RelayState,
    session_id: &str,
    client: &Link,
    backend: &Link,
    client_writer: JoinHandle<()>,
) {
    counter!("browser_relay_backend_connect_failures_total", 1);
    backend.mark_closed();
    state.registry().remove_if_client(session_id, client.id());
    client.close(CLOSE_INTERNAL_ERROR, BACKEND_UNAVAILABLE_REASON);
    let _ = client_writer.await;
    client.mark_closed();
}

async fn write_client(
    mut sink: SplitSink<WebSocket, Message>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            LinkCommand::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(client_close_frame(code, reason))))
                    .await;
                break;
            }
        }
    }
}

async fn write_backend(
    mut sink: SplitSink<BackendSocket, BackendMessage>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Text(text) => {
                if sink.send(BackendMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            LinkCommand::Close { code, reason } => {
                let frame = BackendCloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Owned(reason),
                };
                let _ = sink.send(BackendMessage::Close(Some(frame))).await;
                break;
            }
        }
    }
}

fn client_close_frame(code: u16, reason: String) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Owned(reason),
    }
}
