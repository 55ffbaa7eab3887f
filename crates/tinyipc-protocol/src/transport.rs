//! Frame transport over a bidirectional byte stream.
//!
//! A [`Transport`] pairs a read half and a write half of some byte stream
//! (child process pipes, the current process's stdio, a Unix socket, or an
//! in-memory duplex) and moves whole [`Frame`]s over it. It splits into:
//!
//! - a [`FrameSender`] for the single writer,
//! - a [`FrameReceiver`] for the single reader,
//! - a cloneable [`CloseHandle`] that closes both directions.
//!
//! Closing is idempotent. A pending `receive()` returns `Ok(None)` and a
//! pending `send()` fails with [`ProtocolError::Closed`] as soon as the
//! transport is closed; each half drops its stream when it notices.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, watch};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;
use crate::framing::{read_frame, write_frame};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A stream half shared by its owner and the [`CloseHandle`].
///
/// The owner holds the lock for the whole of a read or write; closing takes
/// the half out whenever it is idle.
type Slot<T> = Arc<Mutex<Option<T>>>;

/// A frame transport over a byte stream.
pub struct Transport {
    sender: FrameSender,
    receiver: FrameReceiver,
    close: CloseHandle,
}

impl Transport {
    /// Creates a transport from a read half and a write half.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(BufReader::new(reader));
        let writer: BoxedWriter = Box::new(writer);
        let reader = Arc::new(Mutex::new(Some(reader)));
        let writer = Arc::new(Mutex::new(Some(writer)));
        let close = CloseHandle::new(reader.clone(), writer.clone());

        let sender = FrameSender {
            writer,
            closed: close.subscribe(),
            _close: close.clone(),
        };
        let receiver = FrameReceiver {
            reader,
            closed: close.subscribe(),
            _close: close.clone(),
        };
        Self {
            sender,
            receiver,
            close,
        }
    }

    /// Creates a transport over the current process's stdin and stdout.
    ///
    /// This is how a worker talks to the host that launched it. Nothing else
    /// in the worker may write to stdout once this is in use.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Creates a transport over a child process's pipes.
    pub fn child(stdout: tokio::process::ChildStdout, stdin: tokio::process::ChildStdin) -> Self {
        Self::new(stdout, stdin)
    }

    /// Creates a transport over a connected Unix domain socket.
    #[cfg(unix)]
    pub fn unix(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }

    /// Creates two transports connected to each other in memory.
    ///
    /// Frames sent on one are received on the other.
    pub fn memory_pair(buffer_size: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(buffer_size);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::new(left_read, left_write),
            Self::new(right_read, right_write),
        )
    }

    /// Returns a handle that closes this transport.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Splits the transport into its sender, receiver and close handle.
    pub fn split(self) -> (FrameSender, FrameReceiver, CloseHandle) {
        (self.sender, self.receiver, self.close)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.close.is_closed())
            .finish_non_exhaustive()
    }
}

/// Write half of a [`Transport`].
///
/// Takes `&mut self`: concurrent writers must be serialized by the owner.
pub struct FrameSender {
    writer: Slot<BoxedWriter>,
    closed: watch::Receiver<bool>,
    _close: CloseHandle,
}

impl FrameSender {
    /// Writes one frame and flushes it.
    pub async fn send(&mut self, frame: &Frame) -> ProtocolResult<()> {
        let mut slot = self.writer.lock().await;
        if *self.closed.borrow() {
            *slot = None;
            return Err(ProtocolError::Closed);
        }
        let Some(writer) = slot.as_mut() else {
            return Err(ProtocolError::Closed);
        };

        let outcome = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => None,
            result = write_frame(writer, frame) => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                *slot = None;
                Err(ProtocolError::Closed)
            }
        }
    }

    /// Shuts down the write direction only.
    ///
    /// The peer observes end of stream; the read direction stays open.
    pub async fn close(&mut self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Returns true if the write direction is no longer usable.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
            || self
                .writer
                .try_lock()
                .is_ok_and(|writer| writer.is_none())
    }
}

/// Read half of a [`Transport`].
pub struct FrameReceiver {
    reader: Slot<BoxedReader>,
    closed: watch::Receiver<bool>,
    _close: CloseHandle,
}

impl FrameReceiver {
    /// Waits for the next frame.
    ///
    /// Returns `Ok(None)` at end of stream or once the transport is closed.
    pub async fn receive(&mut self) -> ProtocolResult<Option<Frame>> {
        let mut slot = self.reader.lock().await;
        if *self.closed.borrow() {
            *slot = None;
            return Ok(None);
        }
        let Some(reader) = slot.as_mut() else {
            return Ok(None);
        };

        let outcome = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => None,
            result = read_frame(reader) => Some(result),
        };

        match outcome {
            Some(Ok(Some(frame))) => Ok(Some(frame)),
            Some(Err(e)) => {
                *slot = None;
                Err(e)
            }
            Some(Ok(None)) | None => {
                *slot = None;
                Ok(None)
            }
        }
    }
}

/// Closes a [`Transport`] from anywhere.
///
/// Closing drops whichever stream halves are idle right away, so the peer
/// sees end of stream even if nobody is reading or writing. A half in the
/// middle of a read or write drops itself as soon as it notices.
#[derive(Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
    reader: Slot<BoxedReader>,
    writer: Slot<BoxedWriter>,
}

impl CloseHandle {
    fn new(reader: Slot<BoxedReader>, writer: Slot<BoxedWriter>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            reader,
            writer,
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Closes the transport. Calling this more than once has no effect.
    pub fn close(&self) {
        self.tx.send_replace(true);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    /// Returns true once the transport has been closed.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the transport is closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        wait_closed(&mut rx).await;
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_pair_roundtrip() {
        let (host, worker) = Transport::memory_pair(1024);
        let (mut host_tx, _host_rx, _host_close) = host.split();
        let (_worker_tx, mut worker_rx, _worker_close) = worker.split();

        let frame = Frame::request(1, "echo", json!({"x": 1}));
        host_tx.send(&frame).await.unwrap();

        let received = worker_rx.receive().await.unwrap();
        assert_eq!(received, Some(frame));
    }

    #[tokio::test]
    async fn send_and_receive_run_concurrently() {
        let (host, worker) = Transport::memory_pair(64);
        let (mut host_tx, mut host_rx, _) = host.split();
        let (mut worker_tx, mut worker_rx, _) = worker.split();

        let echo = tokio::spawn(async move {
            while let Some(frame) = worker_rx.receive().await.unwrap() {
                let reply = Frame::response(frame.correlation_id, frame.payload);
                worker_tx.send(&reply).await.unwrap();
            }
        });

        let reader = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..20 {
                ids.push(host_rx.receive().await.unwrap().unwrap().correlation_id);
            }
            ids
        });

        for id in 1..=20 {
            host_tx
                .send(&Frame::request(id, "echo", json!({"pad": "x".repeat(40)})))
                .await
                .unwrap();
        }

        let ids = reader.await.unwrap();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());

        host_tx.close().await;
        tokio::time::timeout(Duration::from_secs(1), echo)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let (host, _worker) = Transport::memory_pair(1024);
        let (_tx, mut rx, close) = host.split();

        let pending = tokio::spawn(async move { rx.receive().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        close.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn close_releases_idle_streams() {
        let (host, worker) = Transport::memory_pair(1024);
        // Both host halves stay alive but are never polled
        let (host_tx, host_rx, close) = host.split();
        let (_worker_tx, mut worker_rx, _) = worker.split();

        close.close();
        let result = tokio::time::timeout(Duration::from_secs(1), worker_rx.receive())
            .await
            .expect("peer should see end of stream");
        assert!(matches!(result, Ok(None)));
        assert!(host_tx.is_closed());
        drop((host_tx, host_rx));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_sends() {
        let (host, _worker) = Transport::memory_pair(1024);
        let close = host.close_handle();
        let (mut tx, _rx, _) = host.split();

        assert!(!close.is_closed());
        close.close();
        close.close();
        assert!(close.is_closed());
        assert!(tx.is_closed());

        let result = tx.send(&Frame::response(1, json!(null))).await;
        assert!(matches!(result, Err(ProtocolError::Closed)));
        tokio::time::timeout(Duration::from_millis(100), close.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn peer_drop_is_end_of_stream() {
        let (host, worker) = Transport::memory_pair(1024);
        let (_tx, mut rx, _) = host.split();
        drop(worker);

        assert!(matches!(rx.receive().await, Ok(None)));
        assert!(matches!(rx.receive().await, Ok(None)));
    }

    #[tokio::test]
    async fn garbage_is_a_protocol_error() {
        use tokio::io::AsyncWriteExt;

        let (left, mut right) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(left);
        let (_tx, mut rx, _) = Transport::new(read, write).split();

        right.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();
        assert!(matches!(
            rx.receive().await,
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_transport() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let (mut a_tx, _a_rx, _) = Transport::unix(a).split();
        let (_b_tx, mut b_rx, _) = Transport::unix(b).split();

        let frame = Frame::response(5, json!([1, 2, 3]));
        a_tx.send(&frame).await.unwrap();
        assert_eq!(b_rx.receive().await.unwrap(), Some(frame));
    }
}
