//! Wire format encoding and decoding.
//!
//! Implements the 13-byte frame header:
//! ```text
//! ┌──────┬────────────┬──────────┬──────────┐
//! │ Type │ Session ID │ Sequence │ Length   │
//! │ 1 B  │ 4 bytes    │ 4 bytes  │ 4 bytes  │
//! │ u8   │ u32 BE     │ u32 BE   │ u32 BE   │
//! └──────┴────────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. `Length` payload bytes follow the
//! header.

use crate::error::{Result, TunnelError};

/// Header size in bytes (fixed, exactly 13).
pub const HEADER_SIZE: usize = 13;

/// Default maximum payload accepted by the decoder (1 MiB).
///
/// Anything larger is treated as corruption: a well-behaved peer never
/// emits DATA frames above its `max_frame_payload`.
pub const DEFAULT_MAX_DECODE_PAYLOAD: u32 = 1024 * 1024;

/// Session id reserved for channel-level frames (KEEPALIVE).
pub const CHANNEL_SESSION_ID: u32 = 0;

/// Frame type discriminant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Initiator asks the peer to open a session to `host:port`.
    Open = 0x01,
    /// Destination reached, session is open.
    OpenAck = 0x02,
    /// Destination unreachable; payload carries the reason.
    OpenFail = 0x03,
    /// Session payload bytes.
    Data = 0x04,
    /// Sender closed its write direction.
    Close = 0x05,
    /// Acknowledges a received CLOSE.
    CloseAck = 0x06,
    /// Session torn down by an error; payload carries the reason.
    Error = 0x07,
    /// Channel liveness probe, always on session 0.
    KeepAlive = 0x08,
}

impl FrameType {
    /// Whether this frame type belongs to a session (as opposed to the channel).
    #[inline]
    pub fn is_session_frame(&self) -> bool {
        !matches!(self, FrameType::KeepAlive)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::OpenAck),
            0x03 => Ok(FrameType::OpenFail),
            0x04 => Ok(FrameType::Data),
            0x05 => Ok(FrameType::Close),
            0x06 => Ok(FrameType::CloseAck),
            0x07 => Ok(FrameType::Error),
            0x08 => Ok(FrameType::KeepAlive),
            other => Err(TunnelError::ProtocolViolation(format!(
                "Unknown frame type 0x{:02x}",
                other
            ))),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub frame_type: FrameType,
    /// Session the frame belongs to (0 = channel).
    pub session_id: u32,
    /// Per-session, per-direction sequence number.
    pub sequence: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(frame_type: FrameType, session_id: u32, sequence: u32, payload_length: u32) -> Self {
        Self {
            frame_type,
            session_id,
            sequence,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use enclave_tunnel::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(FrameType::Data, 1, 0, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 13);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (13 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.frame_type as u8;
        buf[1..5].copy_from_slice(&self.session_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.sequence.to_be_bytes());
        buf[9..13].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short and
    /// `Err(ProtocolViolation)` for an unknown type code.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some(Self {
            frame_type: FrameType::try_from(buf[0])?,
            session_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            sequence: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            payload_length: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
        }))
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length doesn't exceed max
    /// - Session frames don't use the channel session id, and vice versa
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(TunnelError::ProtocolViolation(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.frame_type.is_session_frame() == (self.session_id == CHANNEL_SESSION_ID) {
            return Err(TunnelError::ProtocolViolation(format!(
                "{:?} frame on session {}",
                self.frame_type, self.session_id
            )));
        }

        Ok(())
    }
}
