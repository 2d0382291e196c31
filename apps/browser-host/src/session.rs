use browser_proto::ControlMode;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{arbiter::ControlArbiter, cdp::CdpSession, viewer::ViewerHandle};

/// A streaming session: one viewer watching one CDP page target.
pub struct HostSession {
    session_id: String,
    viewer: ViewerHandle,
    cdp: Arc<dyn CdpSession>,
    cdp_endpoint: String,
    arbiter: ControlArbiter,
    pump: Mutex<Option<AbortHandle>>,
}

impl HostSession {
    pub fn new(
        session_id: impl Into<String>,
        viewer: ViewerHandle,
        cdp: Arc<dyn CdpSession>,
        cdp_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            viewer,
            cdp,
            cdp_endpoint: cdp_endpoint.into(),
            arbiter: ControlArbiter::default(),
            pump: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn viewer(&self) -> &ViewerHandle {
        &self.viewer
    }

    pub fn cdp(&self) -> &dyn CdpSession {
        self.cdp.as_ref()
    }

    pub fn cdp_endpoint(&self) -> &str {
        &self.cdp_endpoint
    }

    pub fn control_mode(&self) -> ControlMode {
        self.arbiter.mode()
    }

    pub fn set_control_mode(&self, mode: ControlMode) -> ControlMode {
        self.arbiter.set(mode)
    }

    pub fn accepts_user_input(&self) -> bool {
        self.arbiter.accepts_user_input()
    }

    pub(crate) fn attach_pump(&self, handle: AbortHandle) {
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the frame pump and the screencast, then closes the CDP socket.
    /// Failures are logged; teardown always runs to completion.
    pub async fn stop_capture(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.stop_screencast().await;
    }

    /// Variant used by the pump itself, which must not abort its own task.
    pub(crate) async fn stop_capture_from_pump(&self) {
        self.pump.lock().take();
        self.stop_screencast().await;
    }

    async fn stop_screencast(&self) {
        if let Err(err) = self.cdp.call("Page.stopScreencast", json!({})).await {
            warn!(session_id = %self.session_id, error = %err, "failed to stop screencast");
        }
        self.cdp.close().await;
        debug!(session_id = %self.session_id, "capture stopped");
    }
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("session_id", &self.session_id)
            .field("viewer", &self.viewer.id())
            .field("cdp_endpoint", &self.cdp_endpoint)
            .field("control_mode", &self.control_mode())
            .finish()
    }
}
