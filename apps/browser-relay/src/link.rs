use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl LinkState {
    fn encode(self) -> u8 {
        match self {
            LinkState::Connecting => 0,
            LinkState::Open => 1,
            LinkState::Closing => 2,
            LinkState::Closed => 3,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            0 => LinkState::Connecting,
            1 => LinkState::Open,
            2 => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }

    fn is_active(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Open)
    }
}

/// Instruction for the task that owns one side's socket sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Shared handle on one websocket: its lifecycle state plus the queue its
/// writer task drains. Clones refer to the same socket.
#[derive(Debug, Clone)]
pub struct Link {
    id: Uuid,
    state: Arc<AtomicU8>,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl Link {
    /// New link in the `Connecting` state.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                state: Arc::new(AtomicU8::new(LinkState::Connecting.encode())),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LinkState {
        LinkState::decode(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Moves `Connecting` to `Open`. Fails if the link was closed while the
    /// handshake was in flight.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                LinkState::Connecting.encode(),
                LinkState::Open.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.state.store(LinkState::Closed.encode(), Ordering::Release);
    }

    /// Queues a text frame; silently skipped unless the link is open.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.is_open() && self.tx.send(LinkCommand::Text(text.into())).is_ok()
    }

    /// Requests a close handshake. Only the first caller on an active link
    /// gets to pick the code.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !LinkState::decode(current).is_active() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                LinkState::Closing.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let _ = self.tx.send(LinkCommand::Close {
            code,
            reason: reason.into(),
        });
        true
    }
}
