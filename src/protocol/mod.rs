//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken on the inter-VM channel:
//! - 13-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed constructors
//! - `host:port` destinations carried by OPEN

mod destination;
mod frame;
mod frame_buffer;
mod wire_format;

pub use destination::{Destination, MAX_DESTINATION_LEN};
pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    FrameType, Header, CHANNEL_SESSION_ID, DEFAULT_MAX_DECODE_PAYLOAD, HEADER_SIZE,
};
