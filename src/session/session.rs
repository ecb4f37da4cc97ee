//! One multiplexed session: state, sequence counters, inbound queue and
//! parked wakers behind a single lock.
//!
//! Frames are assigned their sequence number and handed to the writer task
//! while the session lock is held, so the order on the wire is the order of
//! the sequence numbers. Wakers are collected under the lock and woken after
//! it is released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::ReadBuf;
use tokio::time::Instant;

use super::state::SessionState;
use super::table::SessionTable;
use crate::backpressure::Backlog;
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{Destination, Frame, FrameType};
use crate::stats::SessionSnapshot;
use crate::writer::{OutboundFrame, WriterHandle};

struct SessionInner {
    state: SessionState,
    inbound: VecDeque<Bytes>,
    inbound_len: usize,
    tx_seq: u32,
    rx_seq: u32,
    last_activity: Instant,
    error: Option<TunnelError>,
    cancelled: bool,
    /// Our CLOSE has been sent and not yet acknowledged.
    close_unacked: bool,
    read_waiters: Vec<Waker>,
    open_waiters: Vec<Waker>,
}

impl SessionInner {
    fn next_tx_seq(&mut self) -> u32 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    fn take_waiters(&mut self) -> Vec<Waker> {
        let mut wakers = std::mem::take(&mut self.read_waiters);
        wakers.append(&mut self.open_waiters);
        wakers
    }

    fn current_error(&self, id: u32) -> TunnelError {
        if self.cancelled {
            return TunnelError::Cancelled;
        }
        match &self.error {
            Some(err) => err.duplicate(),
            None => TunnelError::ChannelFailure(format!("session {} failed", id)),
        }
    }
}

/// A single byte-stream session on a channel.
///
/// Shared as `Arc<Session>` between the channel read loop, the supervisor
/// and whoever consumes the stream (adapter or relay).
pub struct Session {
    id: u32,
    destination: Option<Destination>,
    locally_initiated: bool,
    created_at: Instant,
    max_frame_payload: usize,
    high_water: usize,
    backlog: Arc<Backlog>,
    writer: WriterHandle,
    table: Weak<SessionTable>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        destination: Option<Destination>,
        locally_initiated: bool,
        config: &TunnelConfig,
        writer: WriterHandle,
        table: Weak<SessionTable>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            destination,
            locally_initiated,
            created_at: now,
            max_frame_payload: config.max_frame_payload,
            high_water: config.high_water,
            backlog: Arc::new(Backlog::new(config.high_water, config.low_water)),
            writer,
            table,
            inner: Mutex::new(SessionInner {
                state: SessionState::Opening,
                inbound: VecDeque::new(),
                inbound_len: 0,
                tx_seq: 0,
                // The acceptor has already consumed the OPEN (sequence 0).
                rx_seq: if locally_initiated { 0 } else { 1 },
                last_activity: now,
                error: None,
                cancelled: false,
                close_unacked: false,
                read_waiters: Vec::new(),
                open_waiters: Vec::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The `host:port` this session was opened for.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// True on the side that sent OPEN.
    pub fn is_locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Outbound bytes queued but not yet written to the channel.
    pub fn backlog(&self) -> usize {
        self.backlog.queued()
    }

    /// Bytes received but not yet read.
    pub fn inbound_len(&self) -> usize {
        self.lock().inbound_len
    }

    /// Time since the last frame in or out, or the last read/write.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().last_activity)
    }

    pub(crate) fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            id: self.id,
            state: inner.state,
            destination: self.destination.as_ref().map(|d| d.to_string()),
            locally_initiated: self.locally_initiated,
            age_ms: duration_ms(now.saturating_duration_since(self.created_at)),
            idle_ms: duration_ms(now.saturating_duration_since(inner.last_activity)),
            inbound_bytes: inner.inbound_len,
            outbound_backlog: self.backlog.queued(),
        }
    }

    // ========================================================================
    // Frame emission (caller holds the lock)
    // ========================================================================

    fn send_control(&self, inner: &mut SessionInner, frame_type: FrameType) -> Result<()> {
        let seq = inner.next_tx_seq();
        inner.last_activity = Instant::now();
        self.writer
            .send(OutboundFrame::new(Frame::control(frame_type, self.id, seq)))
    }

    fn send_reason(
        &self,
        inner: &mut SessionInner,
        frame_type: FrameType,
        reason: &str,
    ) -> Result<()> {
        let seq = inner.next_tx_seq();
        inner.last_activity = Instant::now();
        self.writer.send(OutboundFrame::new(Frame::with_reason(
            frame_type, self.id, seq, reason,
        )))
    }

    /// Send OPEN for a locally initiated session.
    pub(crate) fn send_open(&self) -> Result<()> {
        let destination = self
            .destination
            .as_ref()
            .map(|d| d.to_string())
            .ok_or_else(|| TunnelError::InvalidDestination("no destination".into()))?;
        let mut inner = self.lock();
        let seq = inner.next_tx_seq();
        self.writer
            .send(OutboundFrame::new(Frame::open(self.id, seq, &destination)))
    }

    // ========================================================================
    // Inbound frames (channel read loop)
    // ========================================================================

    /// Apply a session frame received from the peer.
    ///
    /// An `Err` is a protocol violation and must fail the whole channel.
    pub(crate) fn on_frame(&self, frame: Frame) -> Result<()> {
        let mut wake = Vec::new();
        {
            let mut inner = self.lock();
            if frame.sequence() != inner.rx_seq {
                return Err(TunnelError::ProtocolViolation(format!(
                    "session {}: expected sequence {}, got {} ({:?})",
                    self.id,
                    inner.rx_seq,
                    frame.sequence(),
                    frame.frame_type()
                )));
            }
            inner.rx_seq = inner.rx_seq.wrapping_add(1);
            inner.last_activity = Instant::now();

            if inner.state == SessionState::Failed {
                tracing::trace!("session {}: ignoring {:?} after failure", self.id, frame.frame_type());
                return Ok(());
            }

            match frame.frame_type() {
                FrameType::Data => {
                    inner.state = inner.state.on_data()?;
                    if !inner.cancelled && !frame.payload.is_empty() {
                        inner.inbound_len += frame.payload.len();
                        inner.inbound.push_back(frame.payload);
                        wake = std::mem::take(&mut inner.read_waiters);
                    }
                }
                FrameType::OpenAck => {
                    if !self.locally_initiated {
                        return Err(TunnelError::ProtocolViolation(format!(
                            "OPEN_ACK for remotely opened session {}",
                            self.id
                        )));
                    }
                    inner.state = inner.state.on_open_ack()?;
                    tracing::debug!("session {} open", self.id);
                    wake = inner.take_waiters();
                }
                FrameType::OpenFail => {
                    if !self.locally_initiated {
                        return Err(TunnelError::ProtocolViolation(format!(
                            "OPEN_FAIL for remotely opened session {}",
                            self.id
                        )));
                    }
                    inner.state = inner.state.on_open_fail()?;
                    let reason = frame.payload_text();
                    tracing::debug!("session {} refused: {}", self.id, reason);
                    inner.error = Some(TunnelError::DestinationUnreachable(reason));
                    wake = inner.take_waiters();
                }
                FrameType::Close => {
                    inner.state = inner.state.on_remote_close()?;
                    self.send_control(&mut inner, FrameType::CloseAck)?;
                    wake = inner.take_waiters();
                }
                FrameType::CloseAck => inner.close_unacked = false,
                FrameType::Error => {
                    let reason = frame.payload_text();
                    tracing::debug!("session {} failed by peer: {}", self.id, reason);
                    inner.state = SessionState::Failed;
                    inner.error = Some(TunnelError::Remote(reason));
                    inner.inbound.clear();
                    inner.inbound_len = 0;
                    wake = inner.take_waiters();
                }
                FrameType::Open | FrameType::KeepAlive => {
                    return Err(TunnelError::ProtocolViolation(format!(
                        "{:?} routed to session {}",
                        frame.frame_type(),
                        self.id
                    )));
                }
            }
        }

        for waker in wake {
            waker.wake();
        }
        self.backlog.wake_all();
        self.reap_if_done();
        Ok(())
    }

    // ========================================================================
    // Acceptor side
    // ========================================================================

    /// Acknowledge a remotely opened session (OPEN_ACK).
    pub fn accept(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == SessionState::Failed {
            return Err(inner.current_error(self.id));
        }
        inner.state = inner.state.on_accept()?;
        self.send_control(&mut inner, FrameType::OpenAck)
    }

    /// Refuse a remotely opened session (OPEN_FAIL) and discard it.
    pub fn reject(&self, reason: &str) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            if inner.state != SessionState::Opening {
                return Err(TunnelError::InvalidState(format!(
                    "cannot reject session {} in state {:?}",
                    self.id, inner.state
                )));
            }
            inner.state = SessionState::Closed;
            self.send_reason(&mut inner, FrameType::OpenFail, reason)
        };
        self.reap_if_done();
        result
    }

    // ========================================================================
    // Local close / failure
    // ========================================================================

    /// Close the local write direction (CLOSE). A no-op once already closed.
    pub fn close_write(&self) -> Result<()> {
        let (result, wake) = {
            let mut inner = self.lock();
            match inner.state.on_local_close() {
                Some(next) => {
                    inner.state = next;
                    inner.close_unacked = true;
                    let result = self.send_control(&mut inner, FrameType::Close);
                    (result, inner.take_waiters())
                }
                None => (Ok(()), Vec::new()),
            }
        };
        for waker in wake {
            waker.wake();
        }
        self.backlog.wake_all();
        self.reap_if_done();
        result
    }

    /// Full local close: half-close, discard unread data and make every
    /// pending and future read or write return `Cancelled`.
    pub fn cancel(&self) {
        let wake = {
            let mut inner = self.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.inbound.clear();
            inner.inbound_len = 0;
            if let Some(next) = inner.state.on_local_close() {
                inner.state = next;
                inner.close_unacked = true;
                // A dead writer means the channel is failing; the session
                // is about to be failed with it.
                let _ = self.send_control(&mut inner, FrameType::Close);
            }
            inner.take_waiters()
        };
        for waker in wake {
            waker.wake();
        }
        self.backlog.wake_all();
        self.reap_if_done();
    }

    /// Fail the session locally without telling the peer.
    ///
    /// Used when the channel is gone. Returns false if it was already
    /// terminal.
    pub(crate) fn fail(&self, err: TunnelError) -> bool {
        let wake = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                None
            } else {
                inner.state = SessionState::Failed;
                inner.error = Some(err);
                inner.inbound.clear();
                inner.inbound_len = 0;
                Some(inner.take_waiters())
            }
        };
        let failed = wake.is_some();
        for waker in wake.into_iter().flatten() {
            waker.wake();
        }
        self.backlog.wake_all();
        self.reap_if_done();
        failed
    }

    /// Fail the session and report it to the peer with an ERROR frame.
    pub fn abort(&self, err: TunnelError) {
        let wake = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                None
            } else {
                let _ = self.send_reason(&mut inner, FrameType::Error, &err.to_string());
                inner.state = SessionState::Failed;
                inner.error = Some(err);
                inner.inbound.clear();
                inner.inbound_len = 0;
                Some(inner.take_waiters())
            }
        };
        for waker in wake.into_iter().flatten() {
            waker.wake();
        }
        self.backlog.wake_all();
        self.reap_if_done();
    }

    /// Remove this session from its table once nothing is left to deliver
    /// and the peer has acknowledged our CLOSE.
    fn reap_if_done(&self) {
        let done = {
            let inner = self.lock();
            match inner.state {
                SessionState::Failed => true,
                SessionState::Closed => inner.inbound.is_empty() && !inner.close_unacked,
                _ => false,
            }
        };
        if done {
            if let Some(table) = self.table.upgrade() {
                if table.remove(self.id).is_some() {
                    tracing::trace!("session {} removed", self.id);
                }
            }
        }
    }

    // ========================================================================
    // Poll interface
    // ========================================================================

    /// Ready once the OPEN handshake has finished.
    pub fn poll_opened(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut inner = self.lock();
        if inner.cancelled {
            return Poll::Ready(Err(TunnelError::Cancelled));
        }
        match inner.state {
            SessionState::Opening => {
                if !inner.open_waiters.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.open_waiters.push(cx.waker().clone());
                }
                Poll::Pending
            }
            SessionState::Failed => Poll::Ready(Err(inner.current_error(self.id))),
            SessionState::Closed if inner.error.is_some() => {
                Poll::Ready(Err(inner.current_error(self.id)))
            }
            _ => Poll::Ready(Ok(())),
        }
    }

    /// Copy queued inbound bytes into `buf`.
    ///
    /// Ready with nothing filled means end of stream: the peer closed its
    /// direction and everything it sent has been read.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>> {
        let finished = {
            let mut inner = self.lock();
            if inner.cancelled {
                return Poll::Ready(Err(TunnelError::Cancelled));
            }
            if inner.state == SessionState::Failed {
                return Poll::Ready(Err(inner.current_error(self.id)));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if inner.inbound.is_empty() {
                return match inner.state {
                    SessionState::RemoteClosed | SessionState::Closed => Poll::Ready(Ok(())),
                    _ => {
                        if !inner.read_waiters.iter().any(|w| w.will_wake(cx.waker())) {
                            inner.read_waiters.push(cx.waker().clone());
                        }
                        Poll::Pending
                    }
                };
            }

            while buf.remaining() > 0 {
                let Some(front) = inner.inbound.front_mut() else {
                    break;
                };
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front.split_to(n));
                if front.is_empty() {
                    inner.inbound.pop_front();
                }
                inner.inbound_len -= n;
            }
            inner.last_activity = Instant::now();
            inner.state == SessionState::Closed && inner.inbound.is_empty()
        };
        if finished {
            self.reap_if_done();
        }
        Poll::Ready(Ok(()))
    }

    /// Queue up to `buf.len()` bytes as DATA frames.
    ///
    /// Pending while the outbound backlog is above the high-water mark.
    /// Accepts at most what fits below the high-water mark, split into
    /// frames of at most `max_frame_payload` bytes.
    pub fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        if let Err(err) = self.check_writable() {
            return Poll::Ready(Err(err));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        std::task::ready!(self.backlog.poll_ready(cx));

        let mut inner = self.lock();
        if let Err(err) = Self::writable(&inner, self.id) {
            return Poll::Ready(Err(err));
        }

        let room = self
            .high_water
            .saturating_sub(self.backlog.queued())
            .max(self.max_frame_payload);
        let n = buf.len().min(room);
        for chunk in buf[..n].chunks(self.max_frame_payload) {
            let seq = inner.next_tx_seq();
            let frame = Frame::data(self.id, seq, Bytes::copy_from_slice(chunk));
            self.backlog.add(chunk.len());
            if let Err(err) = self
                .writer
                .send(OutboundFrame::tracked(frame, self.backlog.clone()))
            {
                return Poll::Ready(Err(err));
            }
        }
        inner.last_activity = Instant::now();
        Poll::Ready(Ok(n))
    }

    fn check_writable(&self) -> Result<()> {
        Self::writable(&self.lock(), self.id)
    }

    fn writable(inner: &SessionInner, id: u32) -> Result<()> {
        if inner.cancelled || inner.state == SessionState::Failed {
            return Err(inner.current_error(id));
        }
        if !inner.state.can_send() {
            return Err(match inner.state {
                SessionState::Opening => {
                    TunnelError::InvalidState(format!("session {} is not open yet", id))
                }
                _ => TunnelError::SessionClosed(id),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Async conveniences
    // ========================================================================

    /// Wait for the OPEN handshake to finish.
    pub async fn opened(&self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_opened(cx)).await
    }

    /// Read into `buf`; `Ok(0)` is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        std::future::poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut *buf);
            self.poll_read(cx, &mut read_buf)
                .map_ok(|()| read_buf.filled().len())
        })
        .await
    }

    /// Write part of `buf`, waiting for back-pressure to clear.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        std::future::poll_fn(|cx| self.poll_write(cx, buf)).await
    }

    /// Write all of `buf`.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state())
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
