//! Correlated calls over a single transport.
//!
//! A [`CallMultiplexer`] owns both halves of a [`Transport`]:
//!
//! - a writer task drains an outbound queue, so frames hit the wire in the
//!   order calls were issued;
//! - a reader task routes every incoming frame to the caller waiting on its
//!   correlation id.
//!
//! Pending calls live in a table keyed by correlation id. An entry is
//! removed exactly once: by its response, by its timeout, by a cancelled
//! caller, or when the connection fails. Whoever removes it decides the
//! outcome, so a call completes at most once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use tinyipc_protocol::{
    CloseHandle, CorrelationId, Frame, FrameKind, FrameReceiver, FrameSender, ProtocolError,
    Transport,
};

use crate::error::{CallError, CallResult};

/// Why a multiplexer stopped accepting calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The worker closed its output.
    EndOfStream,
    /// The worker sent bytes that are not a valid frame.
    Protocol(String),
    /// Writing to the worker failed.
    WriteFailed(String),
    /// The worker process terminated.
    WorkerExited(String),
    /// The owner closed the client.
    ClientClosed,
}

impl CloseReason {
    /// Returns the error reported to calls affected by this closure.
    pub fn to_error(&self) -> CallError {
        match self {
            Self::ClientClosed => CallError::ClientClosed,
            other => CallError::WorkerUnavailable(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "worker closed the connection"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::WriteFailed(e) => write!(f, "write to worker failed: {e}"),
            Self::WorkerExited(status) => write!(f, "worker {status}"),
            Self::ClientClosed => write!(f, "client closed"),
        }
    }
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallResult<Value>>,
    created_at: Instant,
}

struct PendingTable {
    next_id: CorrelationId,
    calls: HashMap<CorrelationId, PendingCall>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    closed: Option<CloseReason>,
}

struct Shared {
    table: Mutex<PendingTable>,
    permits: Semaphore,
    close: CloseHandle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> CallError {
        self.lock()
            .closed
            .as_ref()
            .map_or(CallError::ClientClosed, CloseReason::to_error)
    }

    fn resolve(&self, id: CorrelationId, result: CallResult<Value>) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            return false;
        };
        trace!(
            correlation_id = id,
            method = %call.method,
            elapsed_ms = call.created_at.elapsed().as_millis(),
            "Call completed"
        );
        // The caller may have given up already
        let _ = call.tx.send(result);
        true
    }

    fn deliver(&self, frame: Frame) {
        let id = frame.correlation_id;
        if !frame.is_compatible() {
            warn!(
                correlation_id = id,
                version = frame.version,
                "Response uses a different protocol version"
            );
        }

        let result = match frame.kind {
            FrameKind::Response => Ok(frame.payload),
            FrameKind::Error => Err(frame
                .error
                .map(CallError::from)
                .unwrap_or_else(|| CallError::WorkerUnavailable("empty error frame".into()))),
            FrameKind::Request => {
                warn!(
                    correlation_id = id,
                    method = frame.method.as_deref().unwrap_or_default(),
                    "Ignoring request frame sent by worker"
                );
                return;
            }
        };

        if !self.resolve(id, result) {
            warn!(
                correlation_id = id,
                "Dropping response for unknown or expired call"
            );
        }
    }

    /// Stops accepting calls and fails every pending one.
    ///
    /// The first reason recorded wins. Already queued frames are still
    /// written.
    fn shut(&self, reason: CloseReason) {
        let (reason, calls) = {
            let mut table = self.lock();
            let reason = table.closed.get_or_insert(reason).clone();
            table.outbound = None;
            (reason, std::mem::take(&mut table.calls))
        };
        self.permits.close();

        if !calls.is_empty() {
            debug!(count = calls.len(), reason = %reason, "Failing pending calls");
        }
        for (_, call) in calls {
            let _ = call.tx.send(Err(reason.to_error()));
        }
    }

    fn fail_all(&self, reason: CloseReason) {
        self.shut(reason);
        self.close.close();
    }
}

/// Removes a call's entry when its caller stops waiting for any reason.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().calls.remove(&self.id);
    }
}

/// Issues correlated calls to a worker and routes their responses.
pub struct CallMultiplexer {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CallMultiplexer {
    /// Takes over `transport` and starts the reader and writer tasks.
    ///
    /// At most `max_in_flight` calls are outstanding at once; further calls
    /// wait for a slot. Must be called from within a Tokio runtime.
    pub fn new(transport: Transport, max_in_flight: usize) -> Self {
        let (sender, receiver, close) = transport.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            table: Mutex::new(PendingTable {
                next_id: 1,
                calls: HashMap::new(),
                outbound: Some(outbound_tx),
                closed: None,
            }),
            permits: Semaphore::new(max_in_flight.max(1)),
            close,
        });

        let writer = tokio::spawn(write_loop(shared.clone(), sender, outbound_rx));
        tokio::spawn(read_loop(shared.clone(), receiver));

        Self {
            shared,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Calls `method` and waits for its result.
    ///
    /// `timeout` runs from the moment the call is made, including any wait
    /// for an in-flight slot. `None` waits until the connection fails.
    pub async fn call(
        &self,
        method: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> CallResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let timed_out = || CallError::Timeout(timeout.unwrap_or_default());

        let Some(permit) = until(deadline, self.shared.permits.acquire()).await else {
            debug!(method, "Timed out waiting for an in-flight slot");
            return Err(timed_out());
        };
        let _permit = permit.map_err(|_| self.shared.closed_error())?;

        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut table = self.shared.lock();
            if let Some(reason) = &table.closed {
                return Err(reason.to_error());
            }
            let Some(outbound) = table.outbound.clone() else {
                return Err(CallError::ClientClosed);
            };

            let id = table.next_id;
            table.next_id += 1;
            if outbound
                .send(Frame::request(id, method, payload))
                .is_err()
            {
                return Err(CloseReason::WriteFailed("writer stopped".into()).to_error());
            }
            table.calls.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    tx,
                    created_at: Instant::now(),
                },
            );
            id
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        trace!(correlation_id = id, method, "Call sent");

        match until(deadline, &mut rx).await {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(self.shared.closed_error()),
            None => {
                let expired = self.shared.lock().calls.remove(&id).is_some();
                if expired {
                    debug!(correlation_id = id, method, "Call timed out");
                    Err(timed_out())
                } else {
                    // Resolved while the deadline fired; take that result
                    rx.await.unwrap_or_else(|_| Err(self.shared.closed_error()))
                }
            }
        }
    }

    /// Calls `method` with typed parameters and decodes the result.
    pub async fn call_as<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> CallResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(params).map_err(CallError::Encode)?;
        let result = self.call(method, payload, timeout).await?;
        serde_json::from_value(result).map_err(CallError::Decode)
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().calls.len()
    }

    /// Returns true once no more calls are accepted.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Returns why the multiplexer closed, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lock().closed.clone()
    }

    /// Fails every pending call and closes the transport immediately.
    pub fn abort(&self, reason: CloseReason) {
        self.shared.fail_all(reason);
    }

    /// Fails every pending call, lets the writer flush queued frames, then
    /// closes the transport.
    pub async fn close(&self, reason: CloseReason) {
        self.shared.shut(reason);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        self.shared.close.close();
    }
}

impl Drop for CallMultiplexer {
    fn drop(&mut self) {
        self.shared.fail_all(CloseReason::ClientClosed);
    }
}

impl fmt::Debug for CallMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.lock();
        f.debug_struct("CallMultiplexer")
            .field("pending", &table.calls.len())
            .field("next_id", &table.next_id)
            .field("closed", &table.closed)
            .finish()
    }
}

async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sender: FrameSender,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sender.send(&frame).await {
            if matches!(e, ProtocolError::Closed) {
                debug!("Transport closed, writer stopping");
            } else {
                warn!(error = %e, "Failed to write frame to worker");
            }
            shared.fail_all(CloseReason::WriteFailed(e.to_string()));
            return;
        }
    }
    sender.close().await;
    debug!("Writer finished");
}

async fn read_loop(shared: Arc<Shared>, mut receiver: FrameReceiver) {
    let reason = loop {
        match receiver.receive().await {
            Ok(Some(frame)) => shared.deliver(frame),
            Ok(None) => break CloseReason::EndOfStream,
            Err(e) => {
                error!(error = %e, "Invalid frame from worker, closing connection");
                break CloseReason::Protocol(e.to_string());
            }
        }
    };
    debug!(reason = %reason, "Reader finished");
    shared.fail_all(reason);
}
