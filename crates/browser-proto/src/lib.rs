//! Shared protocol definitions for viewer ↔ relay ↔ streaming host traffic.
//! Every message travels as a JSON text frame carrying a `type`
//! discriminator; keeping the vocabulary in its own crate lets both services
//! and test clients decode it the same way.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

mod input;

pub use input::{InputEvent, MouseButton};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (service shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Request violated connection policy (e.g. missing session id).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Server hit an unexpected condition.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Connection was evicted because a newer one claimed its session id.
pub const CLOSE_REPLACED: u16 = 4000;

/// Which actor is currently allowed to drive the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Agent,
    User,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Agent => "agent",
            ControlMode::User => "user",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown control mode: {0:?}")]
pub struct UnknownControlMode(pub String);

impl FromStr for ControlMode {
    type Err = UnknownControlMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "agent" => Ok(ControlMode::Agent),
            "user" => Ok(ControlMode::User),
            other => Err(UnknownControlMode(other.to_string())),
        }
    }
}

/// Messages sent by a viewer (through the relay) to the streaming host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ViewerMessage {
    #[serde(rename_all = "camelCase")]
    StartStreaming { session_id: String },
    #[serde(rename_all = "camelCase")]
    StopStreaming { session_id: String },
    /// `mode` stays a raw string so an invalid value can be rejected
    /// without failing the whole frame.
    #[serde(rename = "control-mode", rename_all = "camelCase")]
    SetControlMode { session_id: String, mode: String },
    /// `data` is decoded lazily into [`InputEvent`] once the session is
    /// known to accept user input.
    #[serde(rename_all = "camelCase")]
    UserInput {
        session_id: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    // WebRTC signaling is reserved; payload fields are accepted and ignored.
    #[serde(rename_all = "camelCase")]
    Offer {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ViewerMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ViewerMessage::StartStreaming { session_id }
            | ViewerMessage::StopStreaming { session_id }
            | ViewerMessage::SetControlMode { session_id, .. }
            | ViewerMessage::UserInput { session_id, .. } => Some(session_id),
            ViewerMessage::Offer { session_id }
            | ViewerMessage::Answer { session_id }
            | ViewerMessage::IceCandidate { session_id } => session_id.as_deref(),
            ViewerMessage::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ViewerMessage::StartStreaming { .. } => "start-streaming",
            ViewerMessage::StopStreaming { .. } => "stop-streaming",
            ViewerMessage::SetControlMode { .. } => "control-mode",
            ViewerMessage::UserInput { .. } => "user-input",
            ViewerMessage::Offer { .. } => "offer",
            ViewerMessage::Answer { .. } => "answer",
            ViewerMessage::IceCandidate { .. } => "ice-candidate",
            ViewerMessage::Unknown => "unknown",
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages emitted by the streaming host towards a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    #[serde(rename_all = "camelCase")]
    StreamingStarted {
        session_id: String,
        cdp_endpoint: String,
    },
    #[serde(rename_all = "camelCase")]
    StreamingStopped { session_id: String },
    #[serde(rename_all = "camelCase")]
    ControlModeChanged {
        session_id: String,
        mode: ControlMode,
    },
    /// One screencast frame: base64 JPEG plus capture time in epoch millis.
    #[serde(rename_all = "camelCase")]
    Frame {
        data: String,
        timestamp: i64,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
}

impl HostMessage {
    pub fn error(session_id: Option<&str>, error: impl Into<String>) -> Self {
        HostMessage::Error {
            session_id: session_id.map(str::to_string),
            error: error.into(),
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, HostMessage::Frame { .. })
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_camel_case_viewer_messages() {
        let msg: ViewerMessage =
            serde_json::from_str(r#"{"type":"start-streaming","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            ViewerMessage::StartStreaming {
                session_id: "s1".into()
            }
        );

        let msg: ViewerMessage =
            serde_json::from_str(r#"{"type":"control-mode","sessionId":"s1","mode":"user"}"#)
                .unwrap();
        assert_eq!(msg.kind(), "control-mode");
        assert_eq!(msg.session_id(), Some("s1"));
    }

    #[test]
    fn unknown_types_land_in_the_unknown_arm() {
        let msg: ViewerMessage =
            serde_json::from_str(r#"{"type":"teleport","sessionId":"s1"}"#).unwrap();
        assert_eq!(msg, ViewerMessage::Unknown);
        assert_eq!(msg.session_id(), None);
    }

    #[test]
    fn signaling_messages_ignore_their_payload() {
        let msg: ViewerMessage = serde_json::from_str(
            r#"{"type":"ice-candidate","sessionId":"s9","candidate":{"sdpMid":"0"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ViewerMessage::IceCandidate {
                session_id: Some("s9".into())
            }
        );
    }

    #[test]
    fn missing_type_is_a_decode_error() {
        assert!(serde_json::from_str::<ViewerMessage>(r#"{"sessionId":"s1"}"#).is_err());
        assert!(serde_json::from_str::<ViewerMessage>("not json").is_err());
    }

    #[test]
    fn stop_streaming_serializes_with_wire_names() {
        let text = ViewerMessage::StopStreaming {
            session_id: "abc".into(),
        }
        .to_text()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "stop-streaming", "sessionId": "abc"}));
    }

    #[test]
    fn frame_message_uses_wire_field_names() {
        let frame = HostMessage::Frame {
            data: "/9j/4AAQ".into(),
            timestamp: 1_700_000_000_000,
            session_id: "s1".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "frame",
                "data": "/9j/4AAQ",
                "timestamp": 1_700_000_000_000_i64,
                "sessionId": "s1",
            })
        );
        assert!(frame.is_frame());
    }

    #[test]
    fn error_without_session_omits_the_field() {
        let value = serde_json::to_value(HostMessage::error(None, "Invalid message")).unwrap();
        assert_eq!(value, json!({"type": "error", "error": "Invalid message"}));
    }

    #[test]
    fn control_mode_parses_only_known_values() {
        assert_eq!("agent".parse::<ControlMode>(), Ok(ControlMode::Agent));
        assert_eq!("user".parse::<ControlMode>(), Ok(ControlMode::User));
        assert_eq!(
            "USER".parse::<ControlMode>(),
            Err(UnknownControlMode("USER".into()))
        );
        assert_eq!(ControlMode::default(), ControlMode::Agent);
        let changed = serde_json::to_value(HostMessage::ControlModeChanged {
            session_id: "s1".into(),
            mode: ControlMode::User,
        })
        .unwrap();
        assert_eq!(changed["mode"], "user");
        assert_eq!(changed["type"], "control-mode-changed");
    }
}
