use serde::{Deserialize, Serialize};

/// Synthetic UI input carried in the `data` field of a `user-input` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputEvent {
    Click {
        x: f64,
        y: f64,
        #[serde(default)]
        button: MouseButton,
    },
    #[serde(rename = "mousemove")]
    MouseMove { x: f64, y: f64 },
    #[serde(rename = "keydown")]
    KeyDown {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename = "keyup")]
    KeyUp {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Scroll {
        x: f64,
        y: f64,
        #[serde(default)]
        delta_x: f64,
        #[serde(default)]
        delta_y: f64,
    },
}

impl InputEvent {
    pub fn from_value(value: &serde_json::Value) -> serde_json::Result<Self> {
        InputEvent::deserialize(value)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InputEvent::Click { .. } => "click",
            InputEvent::MouseMove { .. } => "mousemove",
            InputEvent::KeyDown { .. } => "keydown",
            InputEvent::KeyUp { .. } => "keyup",
            InputEvent::Scroll { .. } => "scroll",
        }
    }
}

/// Button names as understood by `Input.dispatchMouseEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    None,
    #[default]
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::None => "none",
            MouseButton::Left => "left",
            MouseButton::Middle => "middle",
            MouseButton::Right => "right",
            MouseButton::Back => "back",
            MouseButton::Forward => "forward",
        }
    }
}
