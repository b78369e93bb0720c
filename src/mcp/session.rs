//! Session lifecycle.
//!
//! A session moves strictly forward: `Uninitialized` → `Initialized` →
//! `ShuttingDown` → `Closed`. Requests arriving in the wrong state are
//! answered with a sequencing error and never reach a handler.

use crate::mcp::protocol::{invalid_request, methods};
use rust_mcp_schema::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Uninitialized,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Gate a request before dispatch. `Ok(())` means the method may run in
    /// the current state; `Err` is the sequencing error to send back.
    pub fn gate_request(&self, method: &str) -> Result<(), RpcError> {
        match self.state {
            SessionState::Uninitialized => {
                if method == methods::INITIALIZE {
                    Ok(())
                } else {
                    Err(invalid_request("Server not initialized"))
                }
            }
            SessionState::Initialized => {
                if method == methods::INITIALIZE {
                    Err(invalid_request("Server already initialized"))
                } else {
                    Ok(())
                }
            }
            SessionState::ShuttingDown | SessionState::Closed => {
                Err(invalid_request("Server is shutting down"))
            }
        }
    }

    /// Handshake accepted.
    pub fn mark_initialized(&mut self) {
        debug_assert_eq!(self.state, SessionState::Uninitialized);
        self.state = SessionState::Initialized;
    }

    /// Shutdown notification received; stop accepting new requests.
    pub fn begin_shutdown(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::ShuttingDown;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
