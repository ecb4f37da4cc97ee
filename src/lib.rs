//! # enclave-tunnel
//!
//! Multiplexed byte-stream tunnel between a hardware enclave and its
//! untrusted host over one inter-VM channel.
//!
//! The enclave terminates TLS itself. The host owns the network interface
//! and only relays opaque bytes: it never sees plaintext and takes no part
//! in the handshake.
//!
//! ## Architecture
//!
//! - **Channel** (vsock / Unix socket): one connection, framed as
//!   `type | session_id | sequence | length | payload`
//! - **Sessions**: any number of independent, ordered byte streams on it
//! - **Enclave side**: [`TunnelStream`] presents a session as an
//!   `AsyncRead + AsyncWrite` socket for a TLS stack
//! - **Host side**: [`HostRelay`] dials each session's destination and
//!   pumps bytes both ways
//!
//! ## Example
//!
//! ```ignore
//! use enclave_tunnel::{transport, Channel, Role, Supervisor, TunnelStream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = transport::connect(&"vsock:3:5000".parse()?).await?;
//!     let (reader, writer) = stream.into_split();
//!     let supervisor = Supervisor::new(Channel::builder(Role::Enclave).start(reader, writer)?);
//!
//!     let socket = TunnelStream::connect(&supervisor, "example.org", 443).await?;
//!     // hand `socket` to tokio-rustls
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod stats;
pub mod transport;

mod backpressure;
mod channel;
mod stream;
mod supervisor;
mod writer;

pub use channel::{Channel, ChannelBuilder};
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use protocol::Destination;
pub use relay::{Dialer, HostRelay, TcpDialer};
pub use session::{Role, Session, SessionState};
pub use stats::{SessionSnapshot, TunnelMetrics, TunnelStats};
pub use stream::{exchange, CloseHandle, TunnelStream};
pub use supervisor::Supervisor;
