use browser_proto::HostMessage;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    cdp::CdpEvent,
    registry::SessionRegistry,
    session::HostSession,
    viewer::FrameDelivery,
};

pub const SCREENCAST_FRAME: &str = "Page.screencastFrame";

/// Payload of a `Page.screencastFrame` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastFrame {
    pub data: String,
    pub session_id: i64,
    #[serde(default)]
    pub metadata: Value,
}

impl ScreencastFrame {
    pub fn from_event(event: &CdpEvent) -> Option<Self> {
        if event.method != SCREENCAST_FRAME {
            return None;
        }
        match ScreencastFrame::deserialize(&event.params) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, "malformed screencast frame");
                None
            }
        }
    }
}

/// Drives one session's screencast until the viewer or the browser goes away.
///
/// Every frame is acknowledged before it is offered to the viewer, so the
/// browser keeps producing regardless of how fast the viewer drains.
pub async fn pump_frames(
    session: Arc<HostSession>,
    registry: SessionRegistry,
    mut events: mpsc::Receiver<CdpEvent>,
) {
    let session_id = session.session_id().to_string();
    while let Some(event) = events.recv().await {
        let Some(frame) = ScreencastFrame::from_event(&event) else {
            continue;
        };

        match session
            .cdp()
            .call(
                "Page.screencastFrameAck",
                json!({ "sessionId": frame.session_id }),
            )
            .await
        {
            Ok(_) => counter!("browser_host_frame_acks_total", 1),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "screencast ack failed")
            }
        }

        let message = HostMessage::Frame {
            data: frame.data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            session_id: session_id.clone(),
        };
        match session.viewer().offer_frame(message) {
            FrameDelivery::Queued => counter!("browser_host_frames_forwarded_total", 1),
            FrameDelivery::Dropped => {
                counter!("browser_host_frames_dropped_total", 1);
                debug!(session_id = %session_id, "viewer queue full; frame dropped");
            }
            FrameDelivery::ViewerGone => {
                info!(session_id = %session_id, "viewer gone; stopping capture");
                if registry.remove_if_same(&session) {
                    counter!("browser_host_sessions_stopped_total", 1, "reason" => "viewer_gone");
                }
                session.stop_capture_from_pump().await;
                return;
            }
        }
    }

    // Event channel closed: the CDP socket is gone.
    if registry.remove_if_same(&session) {
        warn!(session_id = %session_id, "browser connection lost");
        counter!("browser_host_sessions_stopped_total", 1, "reason" => "cdp_lost");
        session.stop_capture_from_pump().await;
        session
            .viewer()
            .send(HostMessage::error(
                Some(&session_id),
                "Browser connection lost",
            ))
            .await;
    }
}
