//! Session supervisor: handshake timeouts, idle sessions and channel
//! liveness on top of a [`Channel`].
//!
//! The maintenance task runs two timers:
//! - every `keepalive_interval` it sends KEEPALIVE and declares the channel
//!   dead once nothing has arrived for `keepalive_timeout`
//! - a sweep closes sessions idle for `idle_timeout`; a session already
//!   half-closed locally that stays idle for another `idle_timeout` is
//!   failed and reported to the peer with ERROR

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::Channel;
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;
use crate::session::{Session, SessionState};
use crate::stats::TunnelStats;

/// Shortest idle sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Owns a channel and keeps its sessions in check.
///
/// Dropping the supervisor shuts the channel down.
pub struct Supervisor {
    channel: Channel,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Arc<Session>>>>,
    maintenance: JoinHandle<()>,
}

impl Supervisor {
    /// Take over `channel` and start the maintenance task.
    pub fn new(channel: Channel) -> Self {
        let incoming = channel.take_incoming();
        let maintenance = tokio::spawn(maintenance_loop(channel.clone()));
        Self {
            channel,
            incoming: Mutex::new(incoming),
            maintenance,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Open a session to `destination` and wait for the handshake.
    ///
    /// Fails with `DestinationUnreachable` on OPEN_FAIL and with
    /// `SessionTimeout` if the peer does not answer within `open_timeout`;
    /// in the latter case ERROR is sent and the session is removed. There
    /// is no retry.
    pub async fn open(&self, destination: &Destination) -> Result<Arc<Session>> {
        let session = self.channel.open_session(destination.clone())?;
        let open_timeout = self.channel.config().open_timeout;

        match tokio::time::timeout(open_timeout, session.opened()).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => {
                tracing::debug!("session {} to {} not opened: {}", session.id(), destination, e);
                Err(e)
            }
            Err(_) => {
                let err = TunnelError::SessionTimeout(format!(
                    "no answer to OPEN for {} within {:?}",
                    destination, open_timeout
                ));
                tracing::warn!("session {}: {}", session.id(), err);
                session.abort(err.duplicate());
                Err(err)
            }
        }
    }

    /// Next session opened by the peer; `None` once the channel is gone.
    pub async fn accept(&self) -> Option<Arc<Session>> {
        let mut incoming = self.incoming.lock().await;
        incoming.as_mut()?.recv().await
    }

    pub fn stats(&self) -> TunnelStats {
        self.channel.stats()
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    /// Resolves once the channel has failed or been shut down.
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    /// Tear the channel down, failing every live session.
    pub fn shutdown(&self) {
        self.channel.shutdown();
        self.maintenance.abort();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn maintenance_loop(channel: Channel) {
    let config = channel.config().clone();

    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval((config.idle_timeout / 4).max(MIN_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = channel.closed() => return,
            _ = keepalive.tick() => {
                let silence = channel.inbound_idle();
                if silence >= config.keepalive_timeout {
                    channel.fail(TunnelError::ChannelFailure(format!(
                        "no traffic from peer for {:?}",
                        silence
                    )));
                    return;
                }
                if let Err(e) = channel.send_keepalive() {
                    channel.fail(e);
                    return;
                }
            }
            _ = sweep.tick() => sweep_idle(&channel, config.idle_timeout),
        }
    }
}

fn sweep_idle(channel: &Channel, idle_timeout: Duration) {
    let now = Instant::now();
    for session in channel.table().sessions() {
        if session.idle_for(now) < idle_timeout {
            continue;
        }
        match session.state() {
            SessionState::Open | SessionState::RemoteClosed => {
                tracing::info!("session {} idle for {:?}, closing", session.id(), idle_timeout);
                if let Err(e) = session.close_write() {
                    tracing::debug!("session {}: close failed: {}", session.id(), e);
                }
                // The next phase waits another full idle interval.
                session.touch();
            }
            SessionState::Opening | SessionState::LocalClosing => {
                tracing::warn!("session {} idle after close, failing", session.id());
                session.abort(TunnelError::SessionTimeout(format!(
                    "session {} idle for {:?}",
                    session.id(),
                    idle_timeout
                )));
            }
            // Closed but undrained, or our CLOSE was never acknowledged.
            SessionState::Closed | SessionState::Failed => {
                channel.table().remove(session.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use tokio::io::duplex;

    fn pair(idle: Duration) -> (Supervisor, Supervisor) {
        let (a, b) = duplex(64 * 1024);
        let enclave = Channel::builder(Role::Enclave)
            .open_timeout(Duration::from_millis(100))
            .connect_timeout(Duration::from_millis(50))
            .idle_timeout(idle)
            .start_stream(a)
            .unwrap();
        let host = Channel::builder(Role::Host)
            .idle_timeout(idle)
            .start_stream(b)
            .unwrap();
        (Supervisor::new(enclave), Supervisor::new(host))
    }

    fn dest() -> Destination {
        "example.org:443".parse().unwrap()
    }

    #[tokio::test]
    async fn test_open_timeout_sends_error_and_removes() {
        let (enclave, host) = pair(Duration::from_secs(60));

        let result = enclave.open(&dest()).await;
        assert!(matches!(result, Err(TunnelError::SessionTimeout(_))));
        assert_eq!(enclave.stats().live_sessions, 0);

        // The host never accepted; ERROR fails and removes its side too.
        let remote = host.accept().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while remote.state() != SessionState::Failed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(host.stats().live_sessions, 0);
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (enclave, host) = pair(Duration::from_secs(60));
        let acceptor = tokio::spawn(async move {
            let session = host.accept().await.unwrap();
            session.accept().unwrap();
            (host, session)
        });

        let session = enclave.open(&dest()).await.unwrap();
        assert_eq!(session.state(), SessionState::Open);
        let (_host, remote) = acceptor.await.unwrap();
        assert_eq!(remote.destination(), Some(&dest()));
    }

    #[tokio::test]
    async fn test_idle_session_closed_then_failed() {
        let (enclave, host) = pair(Duration::from_millis(50));
        let acceptor = tokio::spawn(async move {
            let session = host.accept().await.unwrap();
            session.accept().unwrap();
            (host, session)
        });
        let session = enclave.open(&dest()).await.unwrap();
        let (host, remote) = acceptor.await.unwrap();

        // Both sides idle into a local CLOSE; once the CLOSEs are
        // acknowledged both leave the table.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.state().is_terminal()
                || !remote.state().is_terminal()
                || enclave.stats().live_sessions > 0
                || host.stats().live_sessions > 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accept_none_after_shutdown() {
        let (enclave, host) = pair(Duration::from_secs(60));
        host.shutdown();
        assert!(host.accept().await.is_none());
        assert!(!host.is_alive());

        tokio::time::timeout(Duration::from_secs(1), enclave.closed())
            .await
            .unwrap();
        assert!(matches!(
            enclave.open(&dest()).await,
            Err(TunnelError::ChannelFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_silence_fails_channel() {
        // Raw peer that never answers.
        let (a, _silent_peer) = duplex(64 * 1024);
        let channel = Channel::builder(Role::Enclave)
            .keepalive(Duration::from_secs(1), Duration::from_secs(3))
            .start_stream(a)
            .unwrap();
        let supervisor = Supervisor::new(channel);

        tokio::time::timeout(Duration::from_secs(10), supervisor.closed())
            .await
            .unwrap();
        let stats = supervisor.stats();
        assert!(!stats.channel_alive);
        assert_eq!(stats.channel_failures, 1);
    }
}
