//! Enclave-side socket adapter.
//!
//! [`TunnelStream`] presents one tunnel session as an ordinary byte stream,
//! so a TLS stack inside the enclave can run its handshake and records over
//! it exactly as over a TCP socket. Bytes are passed through unchanged; the
//! adapter has no buffer of its own.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;
use crate::protocol::Destination;
use crate::session::{Session, SessionState};
use crate::supervisor::Supervisor;

/// Read size used by [`exchange`].
const EXCHANGE_READ_SIZE: usize = 16 * 1024;

/// A connected tunnel session used as a stream socket.
///
/// All methods take `&self`, so the stream can be shared between a reading
/// and a writing task through an `Arc`. Dropping it closes the session.
#[derive(Debug)]
pub struct TunnelStream {
    session: Arc<Session>,
}

/// Closes a [`TunnelStream`] from another task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    session: Arc<Session>,
}

impl CloseHandle {
    /// Same as [`TunnelStream::close`].
    pub fn close(&self) {
        self.session.cancel();
    }
}

impl TunnelStream {
    /// Open a tunnel to `host:port` and wait until the host has connected.
    ///
    /// Fails with `DestinationUnreachable` if the host could not connect and
    /// with `SessionTimeout` if it did not answer in time.
    pub async fn connect(supervisor: &Supervisor, host: &str, port: u16) -> Result<Self> {
        let destination = Destination::new(host, port)?;
        Self::connect_to(supervisor, &destination).await
    }

    pub async fn connect_to(supervisor: &Supervisor, destination: &Destination) -> Result<Self> {
        let session = supervisor.open(destination).await?;
        Ok(Self { session })
    }

    /// Wrap an already open session.
    pub fn from_session(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> u32 {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Read into `buf`. `Ok(0)` means the remote side closed and every byte
    /// it sent has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.session.read(buf).await
    }

    /// Write part of `buf`; suspends while the outbound backlog is full.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.session.write(buf).await
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.session.write_all(buf).await
    }

    /// Half-close: no more writes, reading continues.
    pub fn shutdown(&self) -> Result<()> {
        self.session.close_write()
    }

    /// Full close. Pending and later reads and writes return `Cancelled`.
    pub fn close(&self) {
        self.session.cancel();
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            session: self.session.clone(),
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.session.poll_read(cx, buf).map_err(Into::into)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.session.poll_write(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Accepted bytes are already on the ordered write path.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(self.session.close_write().map_err(Into::into))
    }
}

/// One request/response round trip over a fresh tunnel: write `request`,
/// half-close, and read until the destination closes.
///
/// A failure at any point is returned as an error, never as a truncated
/// response.
pub async fn exchange(
    supervisor: &Supervisor,
    host: &str,
    port: u16,
    request: &[u8],
) -> Result<Bytes> {
    let stream = TunnelStream::connect(supervisor, host, port).await?;
    stream.write_all(request).await?;
    stream.shutdown()?;

    let mut response = BytesMut::new();
    let mut buf = vec![0u8; EXCHANGE_READ_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    Ok(response.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::error::TunnelError;
    use crate::session::Role;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn supervisors() -> (Supervisor, Supervisor) {
        let (a, b) = duplex(256 * 1024);
        let enclave = Channel::builder(Role::Enclave).start_stream(a).unwrap();
        let host = Channel::builder(Role::Host).start_stream(b).unwrap();
        (Supervisor::new(enclave), Supervisor::new(host))
    }

    /// Accepts one session on the host side and echoes it back.
    fn spawn_echo(host: Supervisor) -> tokio::task::JoinHandle<Supervisor> {
        tokio::spawn(async move {
            let session = host.accept().await.unwrap();
            session.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = session.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                session.write_all(&buf[..n]).await.unwrap();
            }
            session.close_write().unwrap();
            host
        })
    }

    #[tokio::test]
    async fn test_async_read_write_traits() {
        let (enclave, host) = supervisors();
        let echo = spawn_echo(host);

        let mut stream = TunnelStream::connect(&enclave, "example.org", 443)
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut stream, b"through the tunnel")
            .await
            .unwrap();
        AsyncWriteExt::shutdown(&mut stream).await.unwrap();

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"through the tunnel");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange() {
        let (enclave, host) = supervisors();
        let echo = spawn_echo(host);

        let response = exchange(&enclave, "example.org", 443, b"GET / HTTP/1.0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(&response[..], b"GET / HTTP/1.0\r\n\r\n");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_pending_read() {
        let (enclave, host) = supervisors();
        let _echo = spawn_echo(host);

        let stream = Arc::new(
            TunnelStream::connect(&enclave, "example.org", 443)
                .await
                .unwrap(),
        );
        let handle = stream.close_handle();
        let reader = stream.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Cancelled)));
        assert!(matches!(
            stream.write(b"late").await,
            Err(TunnelError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let (enclave, _host) = supervisors();
        assert!(matches!(
            TunnelStream::connect(&enclave, "", 443).await,
            Err(TunnelError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_fails_on_channel_loss() {
        let (enclave, host) = supervisors();
        let dropper = tokio::spawn(async move {
            let session = host.accept().await.unwrap();
            session.accept().unwrap();
            let mut buf = [0u8; 4];
            let _ = session.read(&mut buf).await;
            // Dropping the supervisor tears the channel down mid-response.
            drop(host);
        });

        let result = exchange(&enclave, "example.org", 443, b"ping").await;
        assert!(matches!(result, Err(TunnelError::ChannelFailure(_))));
        dropper.await.unwrap();
    }
}
