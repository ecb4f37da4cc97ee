//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use enclave_tunnel::protocol::{Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::data(3, 0, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.frame_type(), FrameType::Data);
//! assert_eq!(frame.session_id(), 3);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameType, Header, CHANNEL_SESSION_ID, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame; the header length is taken from the payload.
    pub fn new(frame_type: FrameType, session_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self {
            header: Header::new(frame_type, session_id, sequence, payload.len() as u32),
            payload,
        }
    }

    /// Create a frame from an already decoded header and its payload.
    pub fn from_parts(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// OPEN carrying the UTF-8 `host:port` destination.
    pub fn open(session_id: u32, sequence: u32, destination: &str) -> Self {
        Self::new(
            FrameType::Open,
            session_id,
            sequence,
            Bytes::copy_from_slice(destination.as_bytes()),
        )
    }

    /// DATA frame.
    pub fn data(session_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, session_id, sequence, payload)
    }

    /// Control frame with an empty payload (OPEN_ACK, CLOSE, CLOSE_ACK).
    pub fn control(frame_type: FrameType, session_id: u32, sequence: u32) -> Self {
        Self::new(frame_type, session_id, sequence, Bytes::new())
    }

    /// Control frame carrying a UTF-8 reason (OPEN_FAIL, ERROR).
    pub fn with_reason(frame_type: FrameType, session_id: u32, sequence: u32, reason: &str) -> Self {
        Self::new(
            frame_type,
            session_id,
            sequence,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Channel-level KEEPALIVE.
    pub fn keepalive(sequence: u32) -> Self {
        Self::control(FrameType::KeepAlive, CHANNEL_SESSION_ID, sequence)
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.header.session_id
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Payload decoded as UTF-8, lossy. Used for OPEN destinations and
    /// OPEN_FAIL / ERROR reasons only; DATA payloads are never inspected.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode the whole frame into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
