#![allow(dead_code)]

use async_trait::async_trait;
use browser_host::{
    cdp::{CdpConnector, CdpError, CdpEvent, CdpSession, EventSink},
    config::DiscoveryPolicy,
    discovery::{DiscoveryError, EndpointLocator},
    HostSettings, StreamingHost,
};
use browser_proto::HostMessage;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub const ENDPOINT: &str = "ws://127.0.0.1:9222/devtools/page/FAKE";

/// Locator that answers after `ready_on` probes, or never.
pub struct FakeLocator {
    pub calls: AtomicU32,
    ready_on: Option<u32>,
    endpoint: String,
}

impl FakeLocator {
    pub fn ready() -> Arc<Self> {
        Self::at(ENDPOINT)
    }

    /// Answers with `endpoint` on the first probe.
    pub fn at(endpoint: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            ready_on: Some(1),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            ready_on: None,
            endpoint: ENDPOINT.to_string(),
        })
    }
}

#[async_trait]
impl EndpointLocator for FakeLocator {
    async fn locate(&self) -> Result<Option<String>, DiscoveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match self.ready_on {
            Some(ready) if call >= ready => Some(self.endpoint.clone()),
            _ => None,
        })
    }
}

/// CDP session that records every call and can be told to fail methods.
#[derive(Default)]
pub struct RecordingCdp {
    calls: Mutex<Vec<(String, Value)>>,
    failing: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl RecordingCdp {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|(method, _)| method).collect()
    }

    pub fn input_calls(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(method, _)| method.starts_with("Input."))
            .map(|(_, params)| params)
            .collect()
    }

    pub fn acks(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(method, _)| method == "Page.screencastFrameAck")
            .map(|(_, params)| params["sessionId"].clone())
            .collect()
    }

    pub fn fail(&self, method: &str) {
        self.failing.lock().push(method.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CdpSession for RecordingCdp {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.calls.lock().push((method.to_string(), params));
        if self.failing.lock().iter().any(|failing| failing == method) {
            return Err(CdpError::Remote {
                code: -32000,
                message: format!("{method} failed"),
            });
        }
        Ok(json!({}))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`RecordingCdp`] per connect and keeps the event sender
/// so tests can play the browser.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<Vec<Arc<RecordingCdp>>>,
    events: Mutex<Vec<Option<mpsc::Sender<CdpEvent>>>>,
    fail_on: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Methods that every subsequently connected session will fail.
    pub fn fail_method(&self, method: &str) {
        self.fail_on.lock().push(method.to_string());
    }

    pub fn connections(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<RecordingCdp> {
        Arc::clone(&self.sessions.lock()[index])
    }

    pub fn latest(&self) -> Arc<RecordingCdp> {
        let sessions = self.sessions.lock();
        Arc::clone(sessions.last().expect("at least one connection"))
    }

    pub async fn emit_frame(&self, index: usize, cdp_session_id: i64) {
        let sender = self.events.lock()[index].clone().expect("event stream open");
        sender
            .send(CdpEvent {
                method: "Page.screencastFrame".into(),
                params: json!({
                    "data": format!("frame-{cdp_session_id}"),
                    "sessionId": cdp_session_id,
                    "metadata": {"pageScaleFactor": 1}
                }),
            })
            .await
            .expect("pump listening");
    }

    /// Simulates the browser socket going away.
    pub fn drop_events(&self, index: usize) {
        self.events.lock()[index].take();
    }
}

#[async_trait]
impl CdpConnector for FakeConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        events: EventSink,
    ) -> Result<Arc<dyn CdpSession>, CdpError> {
        assert!(events.wants("Page.screencastFrame"));
        let session = Arc::new(RecordingCdp::default());
        for method in self.fail_on.lock().iter() {
            session.fail(method);
        }
        self.sessions.lock().push(Arc::clone(&session));
        self.events.lock().push(Some(events.into_sender()));
        Ok(session)
    }
}

pub fn quick_settings() -> HostSettings {
    HostSettings {
        discovery: DiscoveryPolicy {
            attempts: 3,
            interval: Duration::from_millis(100),
        },
        frame_buffer: 8,
        ..HostSettings::default()
    }
}

pub fn host_with(locator: Arc<FakeLocator>, connector: Arc<FakeConnector>) -> StreamingHost {
    StreamingHost::new(locator, connector, quick_settings())
}

pub async fn next_message(rx: &mut mpsc::Receiver<HostMessage>) -> HostMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within deadline")
        .expect("viewer channel open")
}

pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
