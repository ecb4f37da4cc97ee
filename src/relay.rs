//! Host-side blind relay: bridges each accepted session to a real outbound
//! TCP connection.
//!
//! For every session the peer opens:
//! 1. Dial the requested `host:port` (bounded by `connect_timeout`)
//! 2. Failure: OPEN_FAIL with the reason, session discarded
//! 3. Success: OPEN_ACK, then pump bytes both ways until both sides close
//!
//! The relay never looks at the bytes it moves. TLS runs end to end between
//! the enclave and the destination.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;
use crate::session::Session;
use crate::supervisor::Supervisor;

/// Opens the outbound connection for a session.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, destination: &Destination) -> io::Result<Self::Stream>;
}

/// Plain TCP dialer, resolving host names through the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, destination: &Destination) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((destination.host(), destination.port())).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Accepts sessions from a supervisor and relays each one to its
/// destination.
pub struct HostRelay<D: Dialer = TcpDialer> {
    dialer: Arc<D>,
    connect_timeout: Duration,
    read_buffer: usize,
}

impl HostRelay<TcpDialer> {
    pub fn new(config: &TunnelConfig) -> Self {
        Self::with_dialer(TcpDialer, config)
    }
}

impl<D: Dialer> HostRelay<D> {
    pub fn with_dialer(dialer: D, config: &TunnelConfig) -> Self {
        Self {
            dialer: Arc::new(dialer),
            connect_timeout: config.connect_timeout,
            read_buffer: config.relay_read_buffer,
        }
    }

    /// Relay every session the peer opens until the channel is gone.
    pub async fn run(&self, supervisor: &Supervisor) {
        while let Some(session) = supervisor.accept().await {
            tokio::spawn(relay_session(
                self.dialer.clone(),
                session,
                self.connect_timeout,
                self.read_buffer,
            ));
        }
        tracing::info!(
            "Relay stopped: {}",
            supervisor
                .channel()
                .failure_reason()
                .unwrap_or_else(|| "channel closed".to_string())
        );
    }
}

/// Dial, acknowledge and pump one session.
pub async fn relay_session<D: Dialer>(
    dialer: Arc<D>,
    session: Arc<Session>,
    connect_timeout: Duration,
    read_buffer: usize,
) {
    let Some(destination) = session.destination().cloned() else {
        let _ = session.reject("missing destination");
        return;
    };

    tracing::info!("Forwarding session {} to: {}", session.id(), destination);

    let stream = match tokio::time::timeout(connect_timeout, dialer.dial(&destination)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Failed to connect to {}: {}", destination, e);
            refuse(&session, &e.to_string());
            return;
        }
        Err(_) => {
            tracing::warn!("Connect to {} timed out after {:?}", destination, connect_timeout);
            refuse(&session, &format!("connect timed out after {:?}", connect_timeout));
            return;
        }
    };

    // The session may have failed (ERROR, channel loss) while we dialed;
    // the fresh socket is dropped without an ACK.
    if let Err(e) = session.accept() {
        tracing::debug!("Session {} gone before connect finished: {}", session.id(), e);
        return;
    }
    tracing::debug!("Connected to destination: {}", destination);

    match pump(&session, stream, read_buffer).await {
        Ok((to_dest, from_dest)) => tracing::debug!(
            "Session {} closed for {}: {} bytes →, {} bytes ←",
            session.id(),
            destination,
            to_dest,
            from_dest
        ),
        Err(e) => {
            tracing::debug!("Session {} to {} failed: {}", session.id(), destination, e);
            session.abort(e);
        }
    }
}

fn refuse(session: &Session, reason: &str) {
    if let Err(e) = session.reject(reason) {
        tracing::debug!("Session {} not refused: {}", session.id(), e);
    }
}

/// Move bytes both ways until each direction has seen end of stream.
///
/// Returns `(bytes to destination, bytes from destination)`. The first
/// error on either side ends both directions.
async fn pump<S>(session: &Session, stream: S, read_buffer: usize) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut socket_rd, mut socket_wr) = tokio::io::split(stream);

    let socket_to_session = async {
        let mut buf = vec![0u8; read_buffer];
        let mut total = 0u64;
        loop {
            let n = socket_rd.read(&mut buf).await?;
            if n == 0 {
                session.close_write()?;
                return Ok::<u64, TunnelError>(total);
            }
            session.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    };

    let session_to_socket = async {
        let mut buf = vec![0u8; read_buffer];
        let mut total = 0u64;
        loop {
            let n = session.read(&mut buf).await?;
            if n == 0 {
                socket_wr.shutdown().await?;
                return Ok::<u64, TunnelError>(total);
            }
            socket_wr.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    };

    let (from_dest, to_dest) = tokio::try_join!(socket_to_session, session_to_socket)?;
    Ok((to_dest, from_dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::session::{Role, SessionState};
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::Mutex;

    /// Hands out pre-made in-memory streams, or refuses.
    struct MemoryDialer {
        streams: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        type Stream = DuplexStream;

        async fn dial(&self, destination: &Destination) -> io::Result<DuplexStream> {
            self.streams.lock().await.pop().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("connection refused: {}", destination),
                )
            })
        }
    }

    fn supervisors() -> (Supervisor, Supervisor) {
        let (a, b) = duplex(256 * 1024);
        let enclave = Channel::builder(Role::Enclave).start_stream(a).unwrap();
        let host = Channel::builder(Role::Host).start_stream(b).unwrap();
        (Supervisor::new(enclave), Supervisor::new(host))
    }

    fn spawn_relay(host: Supervisor, streams: Vec<DuplexStream>) -> tokio::task::JoinHandle<()> {
        let relay = HostRelay::with_dialer(
            MemoryDialer {
                streams: Mutex::new(streams),
            },
            &TunnelConfig::default(),
        );
        tokio::spawn(async move { relay.run(&host).await })
    }

    #[tokio::test]
    async fn test_relay_echo_roundtrip() {
        let (enclave, host) = supervisors();
        let (relay_side, mut server) = duplex(64 * 1024);
        let _relay = spawn_relay(host, vec![relay_side]);

        // Upper-cases whatever it gets, then closes.
        let server_task = tokio::spawn(async move {
            let mut request = Vec::new();
            server.read_to_end(&mut request).await.unwrap();
            server
                .write_all(&request.to_ascii_uppercase())
                .await
                .unwrap();
            server.shutdown().await.unwrap();
        });

        let session = enclave
            .open(&"example.org:443".parse().unwrap())
            .await
            .unwrap();
        session.write_all(b"hello relay").await.unwrap();
        session.close_write().unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = session.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        assert_eq!(response, b"HELLO RELAY");
        server_task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_dial_failure_sends_open_fail() {
        let (enclave, host) = supervisors();
        let _relay = spawn_relay(host, Vec::new());

        let result = enclave.open(&"example.org:443".parse().unwrap()).await;
        match result {
            Err(TunnelError::DestinationUnreachable(reason)) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("unexpected {:?}", other.map(|s| s.id())),
        }
        assert_eq!(enclave.stats().live_sessions, 0);
    }

    #[tokio::test]
    async fn test_destination_reset_sends_error() {
        let (enclave, host) = supervisors();
        let (relay_side, server) = duplex(64);
        let _relay = spawn_relay(host, vec![relay_side]);

        let session = enclave
            .open(&"example.org:443".parse().unwrap())
            .await
            .unwrap();
        // Destination vanishes; the relay's socket write fails on the next
        // request bytes, or its read sees EOF first.
        drop(server);
        let _ = session.write_all(&[0u8; 1024]).await;

        let mut buf = [0u8; 16];
        let outcome = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match session.read(&mut buf).await {
                    Ok(0) => return None,
                    Ok(_) => continue,
                    Err(e) => return Some(e),
                }
            }
        })
        .await
        .unwrap();
        match outcome {
            Some(err) => assert!(matches!(err, TunnelError::Remote(_))),
            None => assert!(!session.state().can_receive()),
        }
    }
}
