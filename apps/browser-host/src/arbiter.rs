use browser_proto::ControlMode;
use std::sync::atomic::{AtomicU8, Ordering};

const AGENT: u8 = 0;
const USER: u8 = 1;

/// Per-session switch deciding whose input reaches the browser.
#[derive(Debug)]
pub struct ControlArbiter {
    mode: AtomicU8,
}

impl Default for ControlArbiter {
    fn default() -> Self {
        Self::new(ControlMode::default())
    }
}

impl ControlArbiter {
    pub fn new(mode: ControlMode) -> Self {
        Self {
            mode: AtomicU8::new(encode(mode)),
        }
    }

    pub fn mode(&self) -> ControlMode {
        match self.mode.load(Ordering::Acquire) {
            USER => ControlMode::User,
            _ => ControlMode::Agent,
        }
    }

    /// Returns the previous mode.
    pub fn set(&self, mode: ControlMode) -> ControlMode {
        match self.mode.swap(encode(mode), Ordering::AcqRel) {
            USER => ControlMode::User,
            _ => ControlMode::Agent,
        }
    }

    pub fn accepts_user_input(&self) -> bool {
        self.mode() == ControlMode::User
    }
}

fn encode(mode: ControlMode) -> u8 {
    match mode {
        ControlMode::Agent => AGENT,
        ControlMode::User => USER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn starts_in_agent_mode() {
        let arbiter = ControlArbiter::default();
        assert_eq!(arbiter.mode(), ControlMode::Agent);
        assert!(!arbiter.accepts_user_input());
    }

    #[test_timeout::timeout]
    fn handing_control_back_and_forth() {
        let arbiter = ControlArbiter::default();
        assert_eq!(arbiter.set(ControlMode::User), ControlMode::Agent);
        assert!(arbiter.accepts_user_input());
        assert_eq!(arbiter.set(ControlMode::Agent), ControlMode::User);
        assert!(!arbiter.accepts_user_input());
    }
}
