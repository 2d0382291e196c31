//! Minimal Chrome DevTools Protocol client.
//!
//! Commands are JSON-RPC style `{id, method, params}` frames; replies are
//! matched back to callers through a pending map keyed by id. Events the
//! caller subscribed to are pushed into its bounded channel; everything else
//! is discarded in the reader, so console chatter never takes queue space
//! from screencast frames. The reader never awaits that channel, so a
//! lagging consumer cannot hold up command replies (including screencast
//! acks).

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("CDP connection closed")]
    Closed,
    #[error("CDP command {method} timed out")]
    Timeout { method: String },
    #[error("CDP error {code}: {message}")]
    Remote { code: i64, message: String },
}

/// Event pushed by the browser (a frame without an `id`).
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// Delivery target for browser events: only the listed methods are queued.
#[derive(Debug, Clone)]
pub struct EventSink {
    methods: Arc<[String]>,
    tx: mpsc::Sender<CdpEvent>,
}

impl EventSink {
    pub fn new(methods: &[&str], tx: mpsc::Sender<CdpEvent>) -> Self {
        Self {
            methods: methods.iter().map(|method| method.to_string()).collect(),
            tx,
        }
    }

    pub fn wants(&self, method: &str) -> bool {
        self.methods.iter().any(|wanted| wanted == method)
    }

    /// Queues a subscribed event without waiting. Unsubscribed events are
    /// discarded.
    pub fn offer(&self, event: CdpEvent) {
        if !self.wants(&event.method) {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(method = %event.method, "CDP event queue full; dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn into_sender(self) -> mpsc::Sender<CdpEvent> {
        self.tx
    }
}

/// A live CDP connection to one page target.
#[async_trait]
pub trait CdpSession: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError>;

    /// Closes the underlying socket. Further calls fail with [`CdpError::Closed`].
    async fn close(&self);
}

#[async_trait]
pub trait CdpConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        events: EventSink,
    ) -> Result<Arc<dyn CdpSession>, CdpError>;
}

#[derive(Debug, Clone)]
pub struct WsCdpConnector {
    call_timeout: Duration,
}

impl WsCdpConnector {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

#[async_trait]
impl CdpConnector for WsCdpConnector {
    async fn connect(
        &self,
        endpoint: &str,
        events: EventSink,
    ) -> Result<Arc<dyn CdpSession>, CdpError> {
        let client = WsCdpClient::connect(endpoint, events, self.call_timeout).await?;
        Ok(Arc::new(client))
    }
}

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, CdpError>>>;

pub struct WsCdpClient {
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
    reader: JoinHandle<()>,
}

impl WsCdpClient {
    pub async fn connect(
        endpoint: &str,
        events: EventSink,
        call_timeout: Duration,
    ) -> Result<Self, CdpError> {
        debug!(endpoint, "connecting to CDP websocket");
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|source| CdpError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Writer ends once every sender is dropped and the queue (including a
        // trailing Close) has drained.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() || is_close {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader_endpoint = endpoint.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(endpoint = %reader_endpoint, error = %err, "CDP socket error");
                        break;
                    }
                };
                route_incoming(&text, &reader_pending, &events);
            }
            reader_closed.store(true, Ordering::SeqCst);
            fail_pending(&reader_pending);
            debug!(endpoint = %reader_endpoint, "CDP reader finished");
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            call_timeout,
            reader,
        })
    }
}

#[async_trait]
impl CdpSession for WsCdpClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CdpError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let command = json!({ "id": id, "method": method, "params": params });
        if self
            .outbound
            .send(WsMessage::Text(command.to_string()))
            .is_err()
        {
            self.pending.remove(&id);
            return Err(CdpError::Closed);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(CdpError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(WsMessage::Close(None));
        fail_pending(&self.pending);
    }
}

impl Drop for WsCdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i64,
    message: String,
}

fn route_incoming(text: &str, pending: &PendingMap, events: &EventSink) {
    let frame: IncomingFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "discarding unparseable CDP frame");
            return;
        }
    };

    if let Some(id) = frame.id {
        let Some((_, reply)) = pending.remove(&id) else {
            debug!(id, "reply for unknown or expired CDP command");
            return;
        };
        let outcome = match frame.error {
            Some(err) => Err(CdpError::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };
        let _ = reply.send(outcome);
        return;
    }

    let Some(method) = frame.method else {
        return;
    };
    events.offer(CdpEvent {
        method,
        params: frame.params,
    });
}

fn fail_pending(pending: &PendingMap) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, reply)) = pending.remove(&id) {
            let _ = reply.send(Err(CdpError::Closed));
        }
    }
}
