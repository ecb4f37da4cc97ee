//! Listening on and connecting to inter-VM endpoints.
//!
//! # Example
//!
//! ```ignore
//! use enclave_tunnel::transport::{connect, VmListener};
//!
//! // Host
//! let listener = VmListener::bind(&"vsock:any:5000".parse()?).await?;
//! let stream = listener.accept().await?;
//!
//! // Enclave
//! let stream = connect(&"vsock:3:5000".parse()?).await?;
//! let (reader, writer) = stream.into_split();
//! ```

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};

#[cfg(feature = "vsock")]
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

use super::endpoint::Endpoint;
use crate::error::Result;

/// Read half of a connected inter-VM stream.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
/// Write half of a connected inter-VM stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A connected inter-VM stream.
pub enum VmStream {
    Unix(UnixStream),
    #[cfg(feature = "vsock")]
    Vsock(VsockStream),
}

impl VmStream {
    /// Split into owned read and write halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            VmStream::Unix(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(feature = "vsock")]
            VmStream::Vsock(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

enum ListenerInner {
    Unix(UnixListener),
    #[cfg(feature = "vsock")]
    Vsock(VsockListener),
}

/// Listener for the host side of the inter-VM channel.
pub struct VmListener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

impl VmListener {
    /// Bind to `endpoint`.
    ///
    /// A stale Unix socket file at the path is removed first.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let inner = match endpoint {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                ListenerInner::Unix(UnixListener::bind(path)?)
            }
            #[cfg(feature = "vsock")]
            Endpoint::Vsock { cid, port } => {
                ListenerInner::Vsock(VsockListener::bind(VsockAddr::new(*cid, *port))?)
            }
            #[cfg(not(feature = "vsock"))]
            Endpoint::Vsock { .. } => return Err(vsock_unsupported()),
        };
        Ok(Self {
            inner,
            endpoint: endpoint.clone(),
        })
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<VmStream> {
        match &self.inner {
            ListenerInner::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                tracing::debug!("Accepted unix socket connection");
                Ok(VmStream::Unix(stream))
            }
            #[cfg(feature = "vsock")]
            ListenerInner::Vsock(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                tracing::debug!("Accepted vsock connection from {:?}", peer_addr);
                Ok(VmStream::Vsock(stream))
            }
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for VmListener {
    fn drop(&mut self) {
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to the host side of the inter-VM channel.
pub async fn connect(endpoint: &Endpoint) -> Result<VmStream> {
    match endpoint {
        Endpoint::Unix(path) => Ok(VmStream::Unix(UnixStream::connect(path).await?)),
        #[cfg(feature = "vsock")]
        Endpoint::Vsock { cid, port } => Ok(VmStream::Vsock(
            VsockStream::connect(VsockAddr::new(*cid, *port)).await?,
        )),
        #[cfg(not(feature = "vsock"))]
        Endpoint::Vsock { .. } => Err(vsock_unsupported()),
    }
}

#[cfg(not(feature = "vsock"))]
fn vsock_unsupported() -> crate::error::TunnelError {
    crate::error::TunnelError::Config("built without the `vsock` feature".to_string())
}
