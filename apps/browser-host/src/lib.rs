//! Streaming and control host.
//!
//! Accepts viewer websockets, attaches each `start-streaming` request to the
//! local browser through the DevTools protocol, streams screencast frames
//! back, and forwards viewer input while the session is in user mode.

pub mod arbiter;
pub mod cdp;
pub mod config;
pub mod discovery;
pub mod host;
pub mod input;
pub mod registry;
pub mod screencast;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod viewer;

pub use host::{HostSettings, StreamingHost};
pub use server::{router, AppState};
