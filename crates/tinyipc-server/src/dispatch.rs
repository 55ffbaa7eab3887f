//! Worker-side dispatch loop.
//!
//! The loop reads one frame at a time, in arrival order, and runs a task per
//! request. Responses go through a single writer task, so handlers finishing
//! concurrently never interleave bytes on the wire.
//!
//! States: `Running → ShuttingDown → Stopped`. End of stream, the stop
//! signal, or a `__shutdown__` request moves the loop to `ShuttingDown`:
//! nothing more is read, in-flight handlers get the drain timeout to finish,
//! queued responses are flushed, and the loop is `Stopped`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{Span, debug, error, info, warn};

use tinyipc_protocol::{
    CorrelationId, ErrorInfo, Frame, FrameKind, FrameSender, ProtocolResult, SHUTDOWN_METHOD,
    Transport,
};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::registry::{Handler, HandlerRegistry};
use crate::signals::ShutdownHandle;

/// Lifecycle of a dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Reading and dispatching requests.
    Running,
    /// No longer reading; waiting for in-flight handlers.
    ShuttingDown,
    /// Done. The transport is closed.
    Stopped,
}

/// Why the read side stopped.
enum Exit {
    EndOfStream,
    StopRequested,
    ShutdownMethod,
    Fatal(ServerError),
}

/// Dispatches incoming requests to registered handlers.
pub struct DispatchLoop {
    registry: Arc<HandlerRegistry>,
    config: ServerConfig,
    shutdown: ShutdownHandle,
    state: watch::Sender<LoopState>,
}

impl DispatchLoop {
    /// Creates a loop serving `registry`, stopping when `shutdown` fires.
    pub fn new(registry: Arc<HandlerRegistry>, config: ServerConfig, shutdown: ShutdownHandle) -> Self {
        let (state, _) = watch::channel(LoopState::Running);
        Self {
            registry,
            config,
            shutdown,
            state,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on state changes.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Serves requests arriving on `transport` until it ends or the loop is
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the host sent an invalid frame or responses could
    /// not be written. The transport is closed either way.
    pub async fn run(&self, transport: Transport) -> ServerResult<()> {
        let (sender, mut receiver, close) = transport.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(write_responses(sender, out_rx));
        let mut writer_done = false;

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        let stop = self.shutdown.signal().wait();
        tokio::pin!(stop);

        self.state.send_replace(LoopState::Running);
        info!(
            methods = self.registry.len(),
            max_in_flight = self.config.max_in_flight,
            "Dispatch loop running"
        );

        let exit = loop {
            while let Some(result) = tasks.try_join_next() {
                log_join_error(result);
            }

            let frame = tokio::select! {
                biased;
                _ = &mut stop => break Exit::StopRequested,
                result = &mut writer => {
                    writer_done = true;
                    break match flatten(result) {
                        Ok(()) => Exit::EndOfStream,
                        Err(e) => Exit::Fatal(e),
                    };
                }
                result = receiver.receive() => result,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break Exit::EndOfStream,
                Err(e) => break Exit::Fatal(e.into()),
            };

            if !frame.is_compatible() {
                warn!(
                    correlation_id = frame.correlation_id,
                    version = frame.version,
                    "Request uses a different protocol version"
                );
            }

            let id = frame.correlation_id;
            let method = match (frame.kind, frame.method) {
                (FrameKind::Request, Some(method)) => method,
                (kind, _) => {
                    warn!(correlation_id = id, %kind, "Ignoring non-request frame from host");
                    continue;
                }
            };

            if method == SHUTDOWN_METHOD {
                info!(correlation_id = id, "Shutdown requested by host");
                let _ = out_tx.send(Frame::response(id, Value::Null));
                break Exit::ShutdownMethod;
            }

            let Some(handler) = self.registry.get(&method) else {
                debug!(correlation_id = id, method = %method, "No handler for method");
                let _ = out_tx.send(Frame::error(id, ErrorInfo::unknown_method(&method)));
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = &mut stop => break Exit::StopRequested,
                permit = permits.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break Exit::StopRequested;
            };

            let out = out_tx.clone();
            tasks.spawn(async move {
                let reply = invoke(handler, id, method, frame.payload).await;
                let _ = out.send(reply);
                drop(permit);
            });
        };

        self.state.send_replace(LoopState::ShuttingDown);

        let result = match exit {
            Exit::Fatal(e) => {
                error!(error = %e, "Dispatch loop failed");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                drop(out_tx);
                close.close();
                if !writer_done {
                    let _ = writer.await;
                }
                Err(e)
            }
            exit => {
                match exit {
                    Exit::EndOfStream => info!("Host closed the connection"),
                    Exit::StopRequested => info!("Stop requested"),
                    _ => {}
                }
                drop(receiver);
                self.drain(&mut tasks).await;
                drop(out_tx);
                if writer_done {
                    Ok(())
                } else {
                    match flatten(writer.await) {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            // The host may be gone already; nobody is left to
                            // read these responses.
                            debug!(error = %e, "Failed to flush responses");
                            Ok(())
                        }
                    }
                }
            }
        };

        close.close();
        self.state.send_replace(LoopState::Stopped);
        info!("Dispatch loop stopped");
        result
    }

    /// Waits for in-flight handlers, aborting them after the drain timeout.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        debug!(in_flight = tasks.len(), "Waiting for in-flight requests");

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                drain_timeout_ms = self.config.drain_timeout.as_millis(),
                "Aborting requests still running after drain timeout"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Runs one handler and turns its outcome into a frame.
#[tracing::instrument(skip(handler, params), fields(duration_ms))]
async fn invoke(
    handler: Arc<dyn Handler>,
    correlation_id: CorrelationId,
    method: String,
    params: Value,
) -> Frame {
    let start = Instant::now();
    let outcome = AssertUnwindSafe(async move { handler.call(params).await })
        .catch_unwind()
        .await;
    Span::current().record("duration_ms", start.elapsed().as_millis() as u64);

    match outcome {
        Ok(Ok(result)) => {
            debug!("Request handled");
            Frame::response(correlation_id, result)
        }
        Ok(Err(err)) => {
            debug!(code = %err.code, message = %err.message, "Handler returned an error");
            Frame::error(correlation_id, err.into())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = message, "Handler panicked");
            Frame::error(
                correlation_id,
                ErrorInfo::internal(format!("handler panicked: {message}")),
            )
        }
    }
}

async fn write_responses(
    mut sender: FrameSender,
    mut responses: mpsc::UnboundedReceiver<Frame>,
) -> ProtocolResult<()> {
    while let Some(frame) = responses.recv().await {
        sender.send(&frame).await?;
    }
    sender.close().await;
    Ok(())
}

fn flatten(result: Result<ProtocolResult<()>, JoinError>) -> ServerResult<()> {
    match result {
        Ok(result) => result.map_err(ServerError::from),
        Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
    }
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(e) = result
        && !e.is_cancelled()
    {
        error!(error = %e, "Request task failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerError, HandlerResult};
    use crate::signals::SignalHandler;
    use serde_json::json;
    use std::time::Duration;
    use tinyipc_protocol::{ErrorCode, FrameReceiver};
    use tokio::task::JoinHandle;

    async fn echo(params: Value) -> HandlerResult {
        Ok(params)
    }

    async fn slow(params: Value) -> HandlerResult {
        let ms = params["ms"].as_u64().unwrap_or(200);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({"slept": ms}))
    }

    async fn fail(_: Value) -> HandlerResult {
        Err(HandlerError::custom("E_QUOTA", "over quota").with_data(json!({"limit": 3})))
    }

    async fn explode(_: Value) -> HandlerResult {
        panic!("kaboom");
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", echo)
            .register("slow", slow)
            .register("fail", fail)
            .register("explode", explode);
        Arc::new(registry)
    }

    struct Harness {
        dispatch: Arc<DispatchLoop>,
        shutdown: ShutdownHandle,
        run: JoinHandle<ServerResult<()>>,
        tx: FrameSender,
        rx: FrameReceiver,
    }

    fn start(config: ServerConfig) -> Harness {
        let signals = SignalHandler::new();
        let shutdown = signals.shutdown_handle();
        let dispatch = Arc::new(DispatchLoop::new(registry(), config, shutdown.clone()));

        let (host, worker) = Transport::memory_pair(64 * 1024);
        let run = {
            let dispatch = dispatch.clone();
            tokio::spawn(async move { dispatch.run(worker).await })
        };
        let (tx, rx, _) = host.split();
        Harness {
            dispatch,
            shutdown,
            run,
            tx,
            rx,
        }
    }

    async fn next(rx: &mut FrameReceiver) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), rx.receive())
            .await
            .expect("no frame within 5s")
            .unwrap()
            .expect("stream ended")
    }

    #[tokio::test]
    async fn echo_request() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, "echo", json!({"x": 1})))
            .await
            .unwrap();

        let reply = next(&mut h.rx).await;
        assert_eq!(reply, Frame::response(1, json!({"x": 1})));
        assert_eq!(h.dispatch.state(), LoopState::Running);
    }

    #[tokio::test]
    async fn unknown_method_keeps_loop_running() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, "nope", json!(null))).await.unwrap();
        h.tx.send(&Frame::request(2, "echo", json!("still here")))
            .await
            .unwrap();

        let reply = next(&mut h.rx).await;
        assert_eq!(reply.correlation_id, 1);
        assert_eq!(reply.kind, FrameKind::Error);
        let error = reply.error.unwrap();
        assert_eq!(error.code, ErrorCode::UnknownMethod);
        assert!(error.message.contains("nope"));

        let reply = next(&mut h.rx).await;
        assert_eq!(reply, Frame::response(2, json!("still here")));
    }

    #[tokio::test]
    async fn handler_error_becomes_error_frame() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(9, "fail", json!(null))).await.unwrap();

        let reply = next(&mut h.rx).await;
        assert_eq!(reply.correlation_id, 9);
        let error = reply.error.unwrap();
        assert_eq!(error.code.as_str(), "E_QUOTA");
        assert_eq!(error.message, "over quota");
        assert_eq!(error.data, Some(json!({"limit": 3})));
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, "explode", json!(null)))
            .await
            .unwrap();
        h.tx.send(&Frame::request(2, "echo", json!(2))).await.unwrap();

        let mut replies = vec![next(&mut h.rx).await, next(&mut h.rx).await];
        replies.sort_by_key(|f| f.correlation_id);

        let error = replies[0].error.clone().unwrap();
        assert_eq!(error.code, ErrorCode::Internal);
        assert!(error.message.contains("kaboom"));
        assert_eq!(replies[1], Frame::response(2, json!(2)));
    }

    #[tokio::test]
    async fn requests_run_concurrently() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, "slow", json!({"ms": 300})))
            .await
            .unwrap();
        h.tx.send(&Frame::request(2, "echo", json!("fast")))
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await.correlation_id, 2);
        assert_eq!(next(&mut h.rx).await.correlation_id, 1);
    }

    #[tokio::test]
    async fn non_request_frames_are_ignored() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::response(5, json!("stray"))).await.unwrap();
        h.tx.send(&Frame::request(6, "echo", json!(6))).await.unwrap();

        assert_eq!(next(&mut h.rx).await, Frame::response(6, json!(6)));
    }

    #[tokio::test]
    async fn shutdown_method_stops_after_reply() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, SHUTDOWN_METHOD, json!(null)))
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await, Frame::response(1, Value::Null));
        h.run.await.unwrap().unwrap();
        assert_eq!(h.dispatch.state(), LoopState::Stopped);
        assert!(matches!(h.rx.receive().await, Ok(None)));
    }

    #[tokio::test]
    async fn end_of_stream_drains_in_flight_requests() {
        let mut h = start(ServerConfig::default());
        h.tx.send(&Frame::request(1, "slow", json!({"ms": 100})))
            .await
            .unwrap();
        h.tx.close().await;

        assert_eq!(next(&mut h.rx).await, Frame::response(1, json!({"slept": 100})));
        h.run.await.unwrap().unwrap();
        assert_eq!(h.dispatch.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn drain_timeout_aborts_handlers() {
        let mut h = start(ServerConfig::default().with_drain_timeout(Duration::from_millis(50)));
        h.tx.send(&Frame::request(1, "slow", json!({"ms": 60_000})))
            .await
            .unwrap();
        // make sure the request is being handled before stopping
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), h.run)
            .await
            .expect("loop did not stop");
        result.unwrap().unwrap();
        assert!(matches!(h.rx.receive().await, Ok(None)));
    }

    #[tokio::test]
    async fn stop_signal_while_idle() {
        let h = start(ServerConfig::default());
        let mut state = h.dispatch.subscribe();
        h.shutdown.trigger();

        state
            .wait_for(|s| *s == LoopState::Stopped)
            .await
            .unwrap();
        h.run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn garbage_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (host, worker) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(worker);
        let dispatch = DispatchLoop::new(
            registry(),
            ServerConfig::default(),
            SignalHandler::new().shutdown_handle(),
        );

        let (mut host_read, mut host_write) = tokio::io::split(host);
        host_write
            .write_all(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();

        let result = dispatch.run(Transport::new(read, write)).await;
        assert!(matches!(result, Err(ServerError::Protocol(_))));
        assert_eq!(dispatch.state(), LoopState::Stopped);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut host_read, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn in_flight_limit_is_respected() {
        let mut h = start(ServerConfig::default().with_max_in_flight(1));
        h.tx.send(&Frame::request(1, "slow", json!({"ms": 200})))
            .await
            .unwrap();
        h.tx.send(&Frame::request(2, "echo", json!("queued")))
            .await
            .unwrap();

        // With one slot the fast request waits for the slow one
        assert_eq!(next(&mut h.rx).await.correlation_id, 1);
        assert_eq!(next(&mut h.rx).await.correlation_id, 2);
    }
}
