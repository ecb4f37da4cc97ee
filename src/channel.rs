//! Channel engine: one inter-VM connection multiplexing many sessions.
//!
//! A [`Channel`] owns three tasks:
//! 1. the read loop, decoding frames and dispatching them to sessions
//! 2. the writer task, the only writer of the shared stream
//! 3. a monitor that turns a writer error into a channel failure
//!
//! Any I/O error, corrupt frame or protocol violation fails the channel:
//! every session goes to `Failed`, every suspended call is woken with the
//! error, and both halves of the stream are dropped so the peer sees EOF.
//! There is no reconnect.
//!
//! # Example
//!
//! ```ignore
//! use enclave_tunnel::{Channel, Role};
//!
//! let stream = enclave_tunnel::transport::connect(&"unix:/tmp/tunnel.sock".parse()?).await?;
//! let (reader, writer) = stream.into_split();
//! let channel = Channel::builder(Role::Enclave)
//!     .max_frame_payload(8 * 1024)
//!     .start(reader, writer)?;
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{Destination, Frame, FrameBuffer, FrameType};
use crate::session::{Role, Session, SessionTable};
use crate::stats::{TunnelMetrics, TunnelStats};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Read buffer for the inter-VM stream.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for a [`Channel`].
pub struct ChannelBuilder {
    role: Role,
    config: TunnelConfig,
    metrics: Option<Arc<TunnelMetrics>>,
}

impl ChannelBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: TunnelConfig::default(),
            metrics: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Largest DATA payload per frame.
    ///
    /// Default: 16 KiB
    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.config.max_frame_payload = bytes;
        self
    }

    /// Per-session back-pressure watermarks.
    ///
    /// Default: 256 KiB / 64 KiB
    pub fn watermarks(mut self, high: usize, low: usize) -> Self {
        self.config.high_water = high;
        self.config.low_water = low;
        self
    }

    /// OPEN handshake timeout.
    ///
    /// Default: 10 seconds
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Host dial timeout; must stay below the OPEN handshake timeout.
    ///
    /// Default: 8 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Idle interval before a session is closed.
    ///
    /// Default: 300 seconds
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Keep-alive send interval and the silence that kills the channel.
    ///
    /// Default: 15 / 45 seconds
    pub fn keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Share counters with other channels of the process.
    pub fn metrics(mut self, metrics: Arc<TunnelMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the channel tasks over a split stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<R, W>(self, reader: R, writer: W) -> Result<Channel>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        Ok(Channel::start(
            self.role,
            self.config,
            self.metrics.unwrap_or_default(),
            reader,
            writer,
        ))
    }

    /// Spawn the channel tasks over a bidirectional stream.
    pub fn start_stream<S>(self, stream: S) -> Result<Channel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer)
    }
}

struct Shared {
    role: Role,
    config: TunnelConfig,
    table: Arc<SessionTable>,
    writer: WriterHandle,
    metrics: Arc<TunnelMetrics>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Session>>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Session>>>>,
    last_inbound: Mutex<Instant>,
    keepalive_seq: AtomicU32,
    failure: Mutex<Option<String>>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// A running channel. Cheap to clone; all clones refer to the same
/// connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub fn builder(role: Role) -> ChannelBuilder {
        ChannelBuilder::new(role)
    }

    fn start<R, W>(
        role: Role,
        config: TunnelConfig,
        metrics: Arc<TunnelMetrics>,
        reader: R,
        write_half: W,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(write_half);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            role,
            table: SessionTable::new(role, config.clone(), writer.clone()),
            config,
            writer,
            metrics,
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            last_inbound: Mutex::new(Instant::now()),
            keepalive_seq: AtomicU32::new(0),
            failure: Mutex::new(None),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_abort = writer_task.abort_handle();
        let monitor = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let err = match writer_task.await {
                    Ok(Ok(())) => TunnelError::ChannelFailure("writer task stopped".to_string()),
                    Ok(Err(e)) => TunnelError::ChannelFailure(format!("write error: {}", e)),
                    // Aborted by close().
                    Err(_) => return,
                };
                shared.close(err, true);
            })
        };

        let read_task = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let err = read_loop(reader, &shared).await;
                shared.close(err, true);
            })
        };

        lock(&shared.tasks).extend([
            read_task.abort_handle(),
            writer_abort,
            monitor.abort_handle(),
        ]);
        // A task may have failed the channel before its handles were stored.
        if shared.is_failed() {
            for task in lock(&shared.tasks).drain(..) {
                task.abort();
            }
        }

        tracing::debug!("channel started as {:?}", role);
        Channel { shared }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Arc<TunnelMetrics> {
        &self.shared.metrics
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.shared.table
    }

    /// False once the channel has failed or been shut down.
    pub fn is_alive(&self) -> bool {
        !self.shared.is_failed()
    }

    /// Why the channel stopped, if it has.
    pub fn failure_reason(&self) -> Option<String> {
        lock(&self.shared.failure).clone()
    }

    /// Start a locally initiated session: allocate an id and send OPEN.
    ///
    /// Does not wait for the handshake; see [`Session::opened`].
    pub fn open_session(&self, destination: Destination) -> Result<Arc<Session>> {
        if let Some(reason) = self.failure_reason() {
            return Err(TunnelError::ChannelFailure(reason));
        }
        let id = self.shared.table.next_id()?;
        let session = self.shared.table.create(id, Some(destination), true)?;
        if let Err(e) = session.send_open() {
            session.fail(e.duplicate());
            return Err(e);
        }
        self.shared.metrics.record_opened();
        tracing::debug!("session {} opening to {:?}", id, session.destination());
        Ok(session)
    }

    /// Take the queue of remotely opened sessions. Only the first call
    /// gets it; the queue ends when the channel fails.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Arc<Session>>> {
        lock(&self.shared.incoming_rx).take()
    }

    /// Enqueue a frame on the serialized write path.
    ///
    /// Session frames must carry the session's next sequence number; the
    /// session methods take care of that.
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.shared.writer.send(OutboundFrame::new(frame))
    }

    /// Send a KEEPALIVE frame.
    pub fn send_keepalive(&self) -> Result<()> {
        let seq = self.shared.keepalive_seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("sending keepalive {}", seq);
        self.send(Frame::keepalive(seq))
    }

    /// Time since anything was last received.
    pub fn inbound_idle(&self) -> Duration {
        lock(&self.shared.last_inbound).elapsed()
    }

    /// Snapshot of the channel and its sessions.
    pub fn stats(&self) -> TunnelStats {
        let metrics = &self.shared.metrics;
        let sessions = self.shared.table.snapshot();
        TunnelStats {
            role: self.shared.role,
            channel_alive: self.is_alive(),
            live_sessions: sessions.len(),
            channel_failures: metrics.channel_failures(),
            sessions_opened: metrics.sessions_opened(),
            sessions_accepted: metrics.sessions_accepted(),
            sessions,
        }
    }

    /// Declare the channel dead: fail every session and stop the tasks.
    pub fn fail(&self, err: TunnelError) {
        self.shared.close(err, true);
    }

    /// Tear the channel down locally. Not counted as a failure.
    pub fn shutdown(&self) {
        self.shared
            .close(TunnelError::ChannelFailure("channel shut down".to_string()), false);
    }

    /// Resolves once the channel has failed or been shut down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.shared.role)
            .field("alive", &self.is_alive())
            .field("sessions", &self.shared.table.len())
            .finish()
    }
}

impl Shared {
    fn is_failed(&self) -> bool {
        lock(&self.failure).is_some()
    }

    fn close(&self, err: TunnelError, counted: bool) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_some() {
                return;
            }
            *failure = Some(err.to_string());
        }

        if counted {
            self.metrics.record_channel_failure();
            tracing::warn!("channel failed: {}", err);
        } else {
            tracing::debug!("channel closed: {}", err);
        }

        lock(&self.incoming_tx).take();

        let sessions = self.table.drain();
        let failed = sessions
            .iter()
            .filter(|session| session.fail(err.duplicate()))
            .count();
        if failed > 0 {
            tracing::debug!("{} sessions failed with the channel", failed);
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.closed.send_replace(true);
    }

    /// Route one decoded frame. An `Err` fails the channel.
    fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame.frame_type() {
            FrameType::KeepAlive => {
                tracing::trace!("keepalive {} received", frame.sequence());
                Ok(())
            }
            FrameType::Open => self.on_open(frame),
            frame_type => match self.table.lookup(frame.session_id()) {
                Some(session) => session.on_frame(frame),
                None => {
                    tracing::debug!(
                        "dropping {:?} for unknown session {}",
                        frame_type,
                        frame.session_id()
                    );
                    Ok(())
                }
            },
        }
    }

    fn on_open(&self, frame: Frame) -> Result<()> {
        let id = frame.session_id();
        if frame.sequence() != 0 {
            return Err(TunnelError::ProtocolViolation(format!(
                "OPEN for session {} with sequence {}",
                id,
                frame.sequence()
            )));
        }

        let destination = Destination::from_payload(frame.payload());
        let session = self
            .table
            .create(id, destination.as_ref().ok().cloned(), false)?;

        let destination = match destination {
            Ok(destination) => destination,
            Err(e) => {
                tracing::debug!("session {} refused: {}", id, e);
                return session.reject(&e.to_string());
            }
        };

        let queued = match lock(&self.incoming_tx).as_ref() {
            Some(tx) => tx.send(session.clone()).is_ok(),
            None => false,
        };
        if !queued {
            tracing::debug!("session {} refused: nobody accepts sessions", id);
            return session.reject("not accepting sessions");
        }

        self.metrics.record_accepted();
        tracing::debug!("session {} requested {}", id, destination);
        Ok(())
    }
}

/// Read and dispatch until the stream ends or breaks; returns the reason.
async fn read_loop<R>(mut reader: R, shared: &Shared) -> TunnelError
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(shared.config.max_decode_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                return TunnelError::ChannelFailure("inter-VM channel closed by peer".to_string())
            }
            Ok(n) => n,
            Err(e) => return TunnelError::ChannelFailure(format!("read error: {}", e)),
        };
        *lock(&shared.last_inbound) = Instant::now();

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => return e,
        };
        for frame in frames {
            if let Err(e) = shared.dispatch(frame) {
                return e;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
