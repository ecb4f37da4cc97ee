//! Error types for enclave-tunnel.

use std::io;

use thiserror::Error;

/// Main error type for all tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O error on the inter-VM channel or a relayed socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The inter-VM channel is gone. Fatal to every session on it.
    #[error("Channel failure: {0}")]
    ChannelFailure(String),

    /// Corrupt frame, sequence gap, or a frame that is illegal in the
    /// session's current state. Fatal to the channel.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The host could not reach the requested destination (OPEN_FAIL).
    #[error("Destination unreachable: {0}")]
    DestinationUnreachable(String),

    /// OPEN handshake or idle timeout.
    #[error("Session timed out: {0}")]
    SessionTimeout(String),

    /// The local handle was closed while a call was pending.
    #[error("Operation cancelled")]
    Cancelled,

    /// The session no longer accepts writes in this direction.
    #[error("Session {0} is closed for writing")]
    SessionClosed(u32),

    /// The remote side reported an error for the session (ERROR frame).
    #[error("Remote error: {0}")]
    Remote(String),

    /// A local operation that is not allowed in the session's state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// A `host:port` string that can't be used as a destination.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Bad configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error (config files, stats export).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TunnelError {
    /// True for errors that take the whole channel down.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::ChannelFailure(_) | TunnelError::ProtocolViolation(_)
        )
    }

    /// Clone-like copy used when one failure has to be reported to many waiters.
    ///
    /// `io::Error` is not `Clone`, so the I/O variant keeps only kind and message.
    pub(crate) fn duplicate(&self) -> TunnelError {
        match self {
            TunnelError::Io(e) => TunnelError::Io(io::Error::new(e.kind(), e.to_string())),
            TunnelError::ChannelFailure(m) => TunnelError::ChannelFailure(m.clone()),
            TunnelError::ProtocolViolation(m) => TunnelError::ProtocolViolation(m.clone()),
            TunnelError::DestinationUnreachable(m) => {
                TunnelError::DestinationUnreachable(m.clone())
            }
            TunnelError::SessionTimeout(m) => TunnelError::SessionTimeout(m.clone()),
            TunnelError::Cancelled => TunnelError::Cancelled,
            TunnelError::SessionClosed(id) => TunnelError::SessionClosed(*id),
            TunnelError::Remote(m) => TunnelError::Remote(m.clone()),
            TunnelError::InvalidState(m) => TunnelError::InvalidState(m.clone()),
            TunnelError::InvalidDestination(m) => TunnelError::InvalidDestination(m.clone()),
            TunnelError::Config(m) => TunnelError::Config(m.clone()),
            TunnelError::Json(e) => TunnelError::Config(e.to_string()),
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Io(e) => return io::Error::new(e.kind(), err.to_string()),
            TunnelError::ChannelFailure(_) => io::ErrorKind::BrokenPipe,
            TunnelError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            TunnelError::DestinationUnreachable(_) => io::ErrorKind::ConnectionRefused,
            TunnelError::SessionTimeout(_) => io::ErrorKind::TimedOut,
            TunnelError::Cancelled => io::ErrorKind::ConnectionAborted,
            TunnelError::SessionClosed(_) => io::ErrorKind::BrokenPipe,
            TunnelError::Remote(_) => io::ErrorKind::ConnectionReset,
            TunnelError::InvalidState(_) => io::ErrorKind::NotConnected,
            TunnelError::InvalidDestination(_) | TunnelError::Config(_) => {
                io::ErrorKind::InvalidInput
            }
            TunnelError::Json(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Result type alias using TunnelError.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_fatal_classification() {
        assert!(TunnelError::ChannelFailure("gone".into()).is_channel_fatal());
        assert!(TunnelError::ProtocolViolation("gap".into()).is_channel_fatal());
        assert!(!TunnelError::DestinationUnreachable("x".into()).is_channel_fatal());
        assert!(!TunnelError::SessionTimeout("open".into()).is_channel_fatal());
        assert!(!TunnelError::Cancelled.is_channel_fatal());
    }

    #[test]
    fn test_io_error_kinds() {
        let refused: io::Error = TunnelError::DestinationUnreachable("x".into()).into();
        assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);

        let timeout: io::Error = TunnelError::SessionTimeout("open".into()).into();
        assert_eq!(timeout.kind(), io::ErrorKind::TimedOut);

        let cancelled: io::Error = TunnelError::Cancelled.into();
        assert_eq!(cancelled.kind(), io::ErrorKind::ConnectionAborted);

        let io_err: io::Error =
            TunnelError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err = TunnelError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.duplicate() {
            TunnelError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            TunnelError::SessionClosed(7).duplicate(),
            TunnelError::SessionClosed(7)
        ));
    }
}
