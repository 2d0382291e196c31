//! Viewer-facing session orchestration.
//!
//! [`StreamingHost`] decodes viewer messages, owns the session registry, and
//! wires CDP discovery, the screencast pump, and input dispatch together.
//! Every handler recovers locally: failures end up as an `error` message or a
//! log line, never as a dropped connection.

use browser_proto::{ControlMode, HostMessage, InputEvent, ViewerMessage};
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    cdp::{CdpConnector, CdpError, CdpSession, EventSink},
    config::{DiscoveryPolicy, HostConfig, ScreencastSettings},
    discovery::{discover_with_retry, DiscoveryError, EndpointLocator},
    input,
    registry::SessionRegistry,
    screencast::{pump_frames, SCREENCAST_FRAME},
    session::HostSession,
    viewer::ViewerHandle,
};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Cdp(#[from] CdpError),
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub discovery: DiscoveryPolicy,
    pub screencast: ScreencastSettings,
    pub frame_buffer: usize,
}

impl From<&HostConfig> for HostSettings {
    fn from(config: &HostConfig) -> Self {
        Self {
            discovery: config.discovery,
            screencast: config.screencast,
            frame_buffer: config.frame_buffer,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            discovery: DiscoveryPolicy::default(),
            screencast: ScreencastSettings::default(),
            frame_buffer: 32,
        }
    }
}

#[derive(Clone)]
pub struct StreamingHost {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SessionRegistry,
    locator: Arc<dyn EndpointLocator>,
    connector: Arc<dyn CdpConnector>,
    settings: HostSettings,
}

impl StreamingHost {
    pub fn new(
        locator: Arc<dyn EndpointLocator>,
        connector: Arc<dyn CdpConnector>,
        settings: HostSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                locator,
                connector,
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn frame_buffer(&self) -> usize {
        self.inner.settings.frame_buffer
    }

    /// Decodes one text frame. Returns the message when it needs to be
    /// handled; protocol errors are answered directly.
    pub async fn decode(&self, viewer: &ViewerHandle, text: &str) -> Option<ViewerMessage> {
        match serde_json::from_str::<ViewerMessage>(text) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(viewer = %viewer.id(), error = %err, "unparseable viewer message");
                counter!("browser_host_invalid_messages_total", 1);
                viewer
                    .send(HostMessage::error(None, "Invalid message format"))
                    .await;
                None
            }
        }
    }

    pub async fn handle_text(&self, viewer: &ViewerHandle, text: &str) {
        if let Some(message) = self.decode(viewer, text).await {
            self.handle_message(viewer, message).await;
        }
    }

    pub async fn handle_message(&self, viewer: &ViewerHandle, message: ViewerMessage) {
        let kind = message.kind();
        debug!(viewer = %viewer.id(), kind, "viewer message");
        match message {
            ViewerMessage::StartStreaming { session_id } => {
                self.start_streaming(viewer, &session_id).await
            }
            ViewerMessage::StopStreaming { session_id } => self.stop_streaming(&session_id).await,
            ViewerMessage::SetControlMode { session_id, mode } => {
                self.set_control_mode(&session_id, &mode).await
            }
            ViewerMessage::UserInput { session_id, data } => {
                self.user_input(&session_id, &data).await
            }
            ViewerMessage::Offer { session_id }
            | ViewerMessage::Answer { session_id }
            | ViewerMessage::IceCandidate { session_id } => {
                info!(
                    kind,
                    session_id = session_id.as_deref().unwrap_or("-"),
                    "webrtc signaling not supported; ignoring"
                );
            }
            ViewerMessage::Unknown => {
                warn!(viewer = %viewer.id(), "unknown viewer message type");
            }
        }
    }

    pub async fn start_streaming(&self, viewer: &ViewerHandle, session_id: &str) {
        info!(session_id = %session_id, "starting stream");
        match self.open_session(viewer, session_id).await {
            Ok(Some(session)) => {
                counter!("browser_host_sessions_started_total", 1);
                info!(
                    session_id = %session_id,
                    cdp_endpoint = %session.cdp_endpoint(),
                    "streaming started"
                );
                viewer
                    .send(HostMessage::StreamingStarted {
                        session_id: session_id.to_string(),
                        cdp_endpoint: session.cdp_endpoint().to_string(),
                    })
                    .await;
            }
            Ok(None) => {
                debug!(session_id = %session_id, "viewer left during start; session discarded");
            }
            Err(err) => {
                counter!("browser_host_session_start_failures_total", 1);
                warn!(session_id = %session_id, error = %err, "failed to start streaming");
                viewer
                    .send(HostMessage::error(Some(session_id), err.to_string()))
                    .await;
            }
        }
    }

    async fn open_session(
        &self,
        viewer: &ViewerHandle,
        session_id: &str,
    ) -> Result<Option<Arc<HostSession>>, StartError> {
        let endpoint =
            discover_with_retry(self.inner.locator.as_ref(), &self.inner.settings.discovery)
                .await?;

        let (events_tx, events_rx) = mpsc::channel(self.inner.settings.frame_buffer.max(1));
        let events = EventSink::new(&[SCREENCAST_FRAME], events_tx);
        let cdp = self.inner.connector.connect(&endpoint, events).await?;
        if let Err(err) = self.begin_capture(cdp.as_ref()).await {
            cdp.close().await;
            return Err(err.into());
        }

        let session = Arc::new(HostSession::new(session_id, viewer.clone(), cdp, endpoint));
        if !viewer.is_open() {
            session.stop_capture().await;
            return Ok(None);
        }

        if let Some(replaced) = self.inner.registry.insert(Arc::clone(&session)) {
            info!(session_id = %session_id, "replacing existing session");
            replaced.stop_capture().await;
        }

        let pump = tokio::spawn(pump_frames(
            Arc::clone(&session),
            self.inner.registry.clone(),
            events_rx,
        ));
        session.attach_pump(pump.abort_handle());
        Ok(Some(session))
    }

    async fn begin_capture(&self, cdp: &dyn CdpSession) -> Result<(), CdpError> {
        cdp.call("Page.enable", json!({})).await?;
        cdp.call("Runtime.enable", json!({})).await?;
        cdp.call(
            "Page.startScreencast",
            self.inner.settings.screencast.start_params(),
        )
        .await?;
        Ok(())
    }

    pub async fn stop_streaming(&self, session_id: &str) {
        let Some(session) = self.inner.registry.remove(session_id) else {
            debug!(session_id = %session_id, "stop requested for unknown session");
            return;
        };
        session.stop_capture().await;
        counter!("browser_host_sessions_stopped_total", 1, "reason" => "requested");
        info!(session_id = %session_id, "streaming stopped");
        session
            .viewer()
            .send(HostMessage::StreamingStopped {
                session_id: session_id.to_string(),
            })
            .await;
    }

    pub async fn set_control_mode(&self, session_id: &str, mode: &str) {
        let mode = match mode.parse::<ControlMode>() {
            Ok(mode) => mode,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "ignoring control-mode request");
                return;
            }
        };
        let Some(session) = self.inner.registry.get(session_id) else {
            warn!(session_id = %session_id, "control-mode for unknown session");
            return;
        };
        let previous = session.set_control_mode(mode);
        info!(session_id = %session_id, from = %previous, to = %mode, "control mode changed");
        session
            .viewer()
            .send(HostMessage::ControlModeChanged {
                session_id: session_id.to_string(),
                mode,
            })
            .await;
    }

    pub async fn user_input(&self, session_id: &str, data: &Value) {
        let Some(session) = self.inner.registry.get(session_id) else {
            debug!(session_id = %session_id, "input for unknown session dropped");
            counter!("browser_host_input_dropped_total", 1, "reason" => "no_session");
            return;
        };
        if !session.accepts_user_input() {
            debug!(session_id = %session_id, "input dropped; agent has control");
            counter!("browser_host_input_dropped_total", 1, "reason" => "agent_mode");
            return;
        }
        let event = match InputEvent::from_value(data) {
            Ok(event) => event,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "unrecognised user input");
                counter!("browser_host_input_dropped_total", 1, "reason" => "malformed");
                return;
            }
        };
        match input::dispatch(session.cdp(), &event).await {
            Ok(()) => counter!("browser_host_input_dispatched_total", 1, "kind" => event.kind()),
            Err(err) => {
                warn!(session_id = %session_id, kind = event.kind(), error = %err, "input dispatch failed");
                session
                    .viewer()
                    .send(HostMessage::error(
                        Some(session_id),
                        "Failed to process user input",
                    ))
                    .await;
            }
        }
    }

    /// Tears down every session owned by a departing viewer.
    pub async fn viewer_disconnected(&self, viewer: &ViewerHandle) {
        let sessions = self.inner.registry.take_viewer_sessions(viewer.id());
        for session in sessions {
            info!(session_id = %session.session_id(), "viewer disconnected; stopping capture");
            counter!("browser_host_sessions_stopped_total", 1, "reason" => "viewer_disconnected");
            session.stop_capture().await;
        }
    }

    pub async fn shutdown(&self) {
        let sessions = self.inner.registry.drain();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "stopping active sessions");
        }
        for session in sessions {
            session.stop_capture().await;
        }
    }
}
