//! Transport module - the inter-VM stream under a channel.
//!
//! Provides abstraction over:
//! - vsock (production, feature `vsock`)
//! - Unix Domain Sockets (local development)

mod endpoint;
mod socket;

pub use endpoint::{Endpoint, VSOCK_CID_ANY};
pub use socket::{connect, BoxedReader, BoxedWriter, VmListener, VmStream};
