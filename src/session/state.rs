//! Session state machine.
//!
//! ```text
//!            OPEN_ACK / accept            local close
//! Opening ───────────────────► Open ─────────────────► LocalClosing
//!    │                          │                          │
//!    │ OPEN_FAIL / reject       │ remote CLOSE             │ remote CLOSE
//!    ▼                          ▼                          ▼
//!  Closed ◄──────────────── RemoteClosed ──local close──► Closed
//!
//! any state ──channel failure / ERROR / violation──► Failed
//! ```
//!
//! Transition functions are pure; an illegal event is reported as a
//! `ProtocolViolation`, which the multiplexer escalates to the channel.

use serde::Serialize;

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// OPEN sent (initiator) or received (acceptor), awaiting the outcome.
    Opening,
    /// Both directions may carry DATA.
    Open,
    /// Local side sent CLOSE, peer may still send DATA.
    LocalClosing,
    /// Peer sent CLOSE; local side may still drain and send.
    RemoteClosed,
    /// Terminal: both directions closed, or the open was refused.
    Closed,
    /// Terminal: channel loss, corruption, ERROR or protocol violation.
    Failed,
}

impl SessionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether the local side may still send DATA.
    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::RemoteClosed)
    }

    /// Whether the peer may still send DATA.
    #[inline]
    pub fn can_receive(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::LocalClosing)
    }

    /// OPEN_ACK received (initiator).
    pub fn on_open_ack(self) -> Result<Self> {
        match self {
            SessionState::Opening => Ok(SessionState::Open),
            other => Err(violation("OPEN_ACK", other)),
        }
    }

    /// OPEN_FAIL received (initiator).
    pub fn on_open_fail(self) -> Result<Self> {
        match self {
            SessionState::Opening => Ok(SessionState::Closed),
            other => Err(violation("OPEN_FAIL", other)),
        }
    }

    /// Acceptor decided to open the session (about to send OPEN_ACK).
    pub fn on_accept(self) -> Result<Self> {
        match self {
            SessionState::Opening => Ok(SessionState::Open),
            other => Err(invalid_local("accept", other)),
        }
    }

    /// DATA received. Does not change state but is illegal in several.
    pub fn on_data(self) -> Result<Self> {
        if self.can_receive() {
            Ok(self)
        } else {
            Err(violation("DATA", self))
        }
    }

    /// Peer closed its write direction.
    pub fn on_remote_close(self) -> Result<Self> {
        match self {
            SessionState::Open => Ok(SessionState::RemoteClosed),
            SessionState::LocalClosing => Ok(SessionState::Closed),
            other => Err(violation("CLOSE", other)),
        }
    }

    /// Local side closes its write direction.
    ///
    /// Returns `None` when there is nothing to do (already closed locally
    /// or terminal), in which case no CLOSE frame must be sent.
    pub fn on_local_close(self) -> Option<Self> {
        match self {
            SessionState::Open => Some(SessionState::LocalClosing),
            SessionState::RemoteClosed => Some(SessionState::Closed),
            _ => None,
        }
    }
}

fn violation(frame: &str, state: SessionState) -> TunnelError {
    TunnelError::ProtocolViolation(format!("{} received in state {:?}", frame, state))
}

fn invalid_local(op: &str, state: SessionState) -> TunnelError {
    TunnelError::InvalidState(format!("cannot {} a session in state {:?}", op, state))
}
