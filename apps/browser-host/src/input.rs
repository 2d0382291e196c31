use browser_proto::{InputEvent, MouseButton};
use serde_json::{json, Map, Value};

use crate::cdp::{CdpError, CdpSession};

const MOUSE_EVENT: &str = "Input.dispatchMouseEvent";
const KEY_EVENT: &str = "Input.dispatchKeyEvent";

#[derive(Debug, Clone, PartialEq)]
pub struct CdpCommand {
    pub method: &'static str,
    pub params: Value,
}

/// Expands one viewer input event into the CDP calls that reproduce it.
pub fn commands_for(event: &InputEvent) -> Vec<CdpCommand> {
    match event {
        // The leading move lets hover and focus handlers run before the press.
        InputEvent::Click { x, y, button } => vec![
            mouse_moved(*x, *y),
            mouse_button("mousePressed", *x, *y, *button),
            mouse_button("mouseReleased", *x, *y, *button),
        ],
        InputEvent::MouseMove { x, y } => vec![mouse_moved(*x, *y)],
        InputEvent::KeyDown { key, code, text } => {
            vec![key_event("keyDown", key, code.as_deref(), text.as_deref())]
        }
        InputEvent::KeyUp { key, code, text } => {
            vec![key_event("keyUp", key, code.as_deref(), text.as_deref())]
        }
        InputEvent::Scroll {
            x,
            y,
            delta_x,
            delta_y,
        } => vec![CdpCommand {
            method: MOUSE_EVENT,
            params: json!({
                "type": "mouseWheel",
                "x": x,
                "y": y,
                "deltaX": delta_x,
                "deltaY": delta_y,
            }),
        }],
    }
}

/// Sends the commands for `event` in order, stopping at the first failure.
pub async fn dispatch(cdp: &dyn CdpSession, event: &InputEvent) -> Result<(), CdpError> {
    for command in commands_for(event) {
        cdp.call(command.method, command.params).await?;
    }
    Ok(())
}

fn mouse_moved(x: f64, y: f64) -> CdpCommand {
    CdpCommand {
        method: MOUSE_EVENT,
        params: json!({ "type": "mouseMoved", "x": x, "y": y }),
    }
}

fn mouse_button(kind: &str, x: f64, y: f64, button: MouseButton) -> CdpCommand {
    CdpCommand {
        method: MOUSE_EVENT,
        params: json!({
            "type": kind,
            "x": x,
            "y": y,
            "button": button.as_str(),
            "clickCount": 1,
        }),
    }
}

fn key_event(kind: &str, key: &str, code: Option<&str>, text: Option<&str>) -> CdpCommand {
    let mut params = Map::new();
    params.insert("type".into(), Value::from(kind));
    params.insert("key".into(), Value::from(key));
    if let Some(code) = code {
        params.insert("code".into(), Value::from(code));
    }
    if let Some(text) = text {
        params.insert("text".into(), Value::from(text));
    }
    CdpCommand {
        method: KEY_EVENT,
        params: Value::Object(params),
    }
}
