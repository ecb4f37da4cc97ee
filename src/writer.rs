//! Dedicated writer task: the single serialized write path of a channel.
//!
//! Every session hands its encoded frames to one mpsc queue; one task drains
//! it onto the inter-VM stream, so frames from different sessions never
//! interleave mid-frame. Ready frames are batched into vectored writes.
//!
//! ```text
//! Session 1 ─┐
//! Session 2 ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► Writer Task ─► channel
//! Session N ─┘
//! ```
//!
//! The queue itself is unbounded: DATA volume is bounded per session by its
//! [`Backlog`], which the writer task releases once the bytes are written.
//! Control frames are a few bytes each.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::Backlog;
use crate::error::{Result, TunnelError};
use crate::protocol::{Frame, HEADER_SIZE};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the channel.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for most control frames).
    pub payload: Bytes,
    /// Backlog to credit once the payload is on the wire (DATA only).
    backlog: Option<Arc<Backlog>>,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(frame: Frame) -> Self {
        Self {
            header: frame.header.encode(),
            payload: frame.payload,
            backlog: None,
        }
    }

    /// Create a DATA frame whose payload is counted in `backlog`.
    #[inline]
    pub fn tracked(frame: Frame, backlog: Arc<Backlog>) -> Self {
        Self {
            header: frame.header.encode(),
            payload: frame.payload,
            backlog: Some(backlog),
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn written(&self) {
        if let Some(backlog) = &self.backlog {
            backlog.release(self.payload.len());
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across sessions.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame. Never blocks; fails once the writer task is gone.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| TunnelError::ChannelFailure("writer task stopped".to_string()))
    }

    /// Check if the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The JoinHandle resolves when every handle is dropped (clean shutdown,
/// the stream is shut down) or on the first write error.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the channel.
async fn writer_loop<W>(mut rx: mpsc::UnboundedReceiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // All handles dropped: clean shutdown.
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;

        for frame in batch.drain(..) {
            frame.written();
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, FrameType};
    use tokio::io::{duplex, AsyncReadExt};

    fn data(session_id: u32, sequence: u32, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Frame::data(
            session_id,
            sequence,
            Bytes::from_static(payload),
        ))
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = data(1, 0, b"hello");
        assert_eq!(frame.size(), HEADER_SIZE + 5);

        let control = OutboundFrame::new(Frame::control(FrameType::Close, 1, 1));
        assert_eq!(control.size(), HEADER_SIZE);
    }

    #[test]
    fn test_remaining_slices_skip_partial_header() {
        let batch = vec![data(1, 0, b"abc"), data(2, 0, b"defg")];

        let all = build_remaining_slices(&batch, 0);
        assert_eq!(all.len(), 4);

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices.len(), 4);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 3 + 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 2);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_remaining_slices_skip_empty_payload() {
        let batch = vec![OutboundFrame::new(Frame::control(FrameType::Close, 1, 0))];
        assert_eq!(build_remaining_slices(&batch, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_writer_task_preserves_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, task) = spawn_writer_task(client);

        for i in 0..10u32 {
            handle
                .send(OutboundFrame::new(Frame::data(
                    1,
                    i,
                    Bytes::from(format!("chunk-{}", i)),
                )))
                .unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();

        let frames = FrameBuffer::new().push(&bytes).unwrap();
        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence(), i as u32);
            assert_eq!(frame.payload(), format!("chunk-{}", i).as_bytes());
        }
    }

    #[tokio::test]
    async fn test_writer_releases_backlog() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, task) = spawn_writer_task(client);
        let backlog = Arc::new(Backlog::new(100, 10));

        backlog.add(5);
        handle
            .send(OutboundFrame::tracked(
                Frame::data(1, 0, Bytes::from_static(b"12345")),
                backlog.clone(),
            ))
            .unwrap();
        drop(handle);
        task.await.unwrap().unwrap();

        assert_eq!(backlog.queued(), 0);
        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped_fails() {
        let (client, server) = duplex(1024);
        drop(server);
        let (handle, task) = spawn_writer_task(client);

        handle.send(data(1, 0, b"lost")).unwrap();
        assert!(task.await.unwrap().is_err());

        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(data(1, 1, b"x")),
            Err(TunnelError::ChannelFailure(_))
        ));
    }
}
