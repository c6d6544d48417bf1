//! Dedicated writer task for one connection.
//!
//! Every send on a connection goes through an mpsc channel to a single task
//! that owns the socket's write half. This serializes writes, so concurrent
//! senders never interleave bytes, and lets the task batch several queued
//! messages into one vectored write.
//!
//! # Architecture
//!
//! ```text
//! Read loop reply ─┐
//! send_to_client  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! send_to_all     ─┘                                      │
//!                          ack (oneshot) ◄────────────────┘
//! ```
//!
//! Each frame carries an acknowledgement channel that resolves once its
//! bytes are flushed, which is what turns a queued send into a per-send
//! success result.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::shutdown::Shutdown;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Encoded bytes waiting to be written to the socket.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    /// Wire bytes produced by the framer.
    pub(crate) wire: Bytes,
    ack: oneshot::Sender<()>,
}

impl OutboundFrame {
    /// Frame whose receiver resolves once the bytes are flushed.
    ///
    /// The receiver errors if the frame is dropped unwritten.
    pub(crate) fn with_ack(wire: Bytes) -> (Self, oneshot::Receiver<()>) {
        let (ack, rx) = oneshot::channel();
        (Self { wire, ack }, rx)
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.wire.len()
    }

    fn acknowledge(self) {
        let _ = self.ack.send(());
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing frames on the writer task. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Queued but not yet written frames (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame, waiting (up to the timeout) while backpressure is active.
    pub(crate) async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            TransportError::ConnectionClosed
        })
    }

    /// Queue `wire` and wait until it has been flushed to the socket.
    pub(crate) async fn write(&self, wire: Bytes) -> Result<()> {
        let (frame, ack) = OutboundFrame::with_ack(wire);
        self.send(frame).await?;
        ack.await.map_err(|_| TransportError::ConnectionClosed)
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(TransportError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(TransportError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}

/// Spawn the writer task for one connection.
///
/// The task ends when every handle is dropped, when `shutdown` is closed, or on
/// the first write error (which also closes `shutdown`). In every case the
/// write half is shut down so the peer observes end of stream.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    shutdown: Shutdown,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending, shutdown));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    shutdown: Shutdown,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.closed() => break Ok(()),
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break Ok(()),
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = tokio::select! {
            biased;
            _ = shutdown.closed() => break Ok(()),
            written = write_batch(&mut writer, &batch) => written,
        };
        pending.fetch_sub(batch_size, Ordering::Release);

        match written {
            Ok(()) => batch.into_iter().for_each(OutboundFrame::acknowledge),
            Err(e) => {
                warn!(error = %e, "socket write failed, closing connection");
                shutdown.close();
                break Err(e);
            }
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "write half shutdown failed");
    }
    result
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch
        .iter()
        .filter(|frame| !frame.wire.is_empty())
        .map(|frame| IoSlice::new(&frame.wire))
        .collect();
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();

    // Fast path: kernel buffer takes everything at once.
    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(write_zero());
    }

    let mut total_written = written;
    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut frame_start = 0;

    for frame in batch {
        let frame_end = frame_start + frame.size();
        if skip_bytes < frame_end {
            let start_in_frame = skip_bytes.saturating_sub(frame_start);
            slices.push(IoSlice::new(&frame.wire[start_in_frame..]));
        }
        frame_start = frame_end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(bytes: &'static [u8]) -> OutboundFrame {
        OutboundFrame::with_ack(Bytes::from_static(bytes)).0
    }

    #[test]
    fn test_outbound_frame_size() {
        assert_eq!(frame(b"hello").size(), 5);
        assert_eq!(frame(b"").size(), 0);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_write_is_acknowledged() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default(), Shutdown::new());

        handle.write(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default(), Shutdown::new());

        for i in 0..10u32 {
            let wire = Bytes::copy_from_slice(&i.to_be_bytes());
            handle.send(OutboundFrame::with_ack(wire).0).await.unwrap();
        }
        handle.write(Bytes::from_static(b"!")).await.unwrap();

        let mut buf = vec![0u8; 41];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[36..40], &9u32.to_be_bytes());
        assert_eq!(buf[40], b'!');
    }

    #[tokio::test]
    async fn test_send_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(1));
        let handle = WriterHandle::new(tx, pending, 1, Duration::from_millis(5));

        let result = handle.send(frame(b"x")).await;
        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![frame(b"hello"), frame(b"world")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"lo");

        let slices = build_remaining_slices(&batch, 7);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"rld");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner(), b"abcabcabcabcabc".to_vec());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default(), Shutdown::new());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_signal_stops_writer() {
        let (client, mut server) = duplex(4096);
        let shutdown = Shutdown::new();
        let (handle, task) = spawn_writer_task(client, WriterConfig::default(), shutdown.clone());

        shutdown.close();

        assert!(task.await.unwrap().is_ok());
        assert!(matches!(
            handle.write(Bytes::from_static(b"late")).await,
            Err(TransportError::ConnectionClosed)
        ));
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
