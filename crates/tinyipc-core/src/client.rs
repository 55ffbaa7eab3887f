//! Host-side facade over one worker process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tinyipc_protocol::SHUTDOWN_METHOD;

use crate::config::{ClientConfig, LaunchSpec};
use crate::error::{CallResult, SpawnError};
use crate::multiplexer::{CallMultiplexer, CloseReason};
use crate::supervisor::{self, WorkerProcess, WorkerStatus};

/// A connection to one worker process.
///
/// Calls may be issued concurrently from many tasks through a shared
/// reference. Dropping the client without [`Client::close`] fails pending
/// calls and kills the worker.
#[derive(Debug)]
pub struct Client {
    worker: WorkerProcess,
    mux: Arc<CallMultiplexer>,
    config: ClientConfig,
    final_status: Mutex<Option<WorkerStatus>>,
    exit_watch: JoinHandle<()>,
}

impl Client {
    /// Starts the worker described by `spec` and connects to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(spec: &LaunchSpec, config: ClientConfig) -> Result<Self, SpawnError> {
        let (worker, transport) = supervisor::spawn(spec)?;
        let mux = Arc::new(CallMultiplexer::new(transport, config.max_in_flight));
        worker.mark_running();

        let exit_watch = tokio::spawn(fail_calls_on_exit(
            worker.subscribe(),
            Arc::downgrade(&mux),
        ));
        info!(
            pid = worker.pid(),
            program = worker.program(),
            max_in_flight = config.max_in_flight,
            "Connected to worker"
        );

        Ok(Self {
            worker,
            mux,
            config,
            final_status: Mutex::new(None),
            exit_watch,
        })
    }

    /// Calls `method` with a JSON payload.
    ///
    /// A `None` timeout uses [`ClientConfig::default_timeout`].
    pub async fn call(
        &self,
        method: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> CallResult<Value> {
        self.mux
            .call(method, payload, timeout.or(self.config.default_timeout))
            .await
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
        self.mux
            .call_as(method, params, timeout.or(self.config.default_timeout))
            .await
    }

    /// Returns the worker's current status.
    pub fn status(&self) -> WorkerStatus {
        self.worker.status()
    }

    /// Returns the worker's process id.
    pub fn pid(&self) -> Option<u32> {
        self.worker.pid()
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.mux.pending_count()
    }

    /// Returns true if calls can still be issued.
    pub fn is_connected(&self) -> bool {
        !self.mux.is_closed()
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shuts the worker down and returns its final status.
    ///
    /// The worker is first asked to stop with a shutdown request. Calls still
    /// pending afterwards fail with `ClientClosed`, then the worker's input
    /// is closed and it is killed if it outlives the grace period. Closing
    /// again returns the same status.
    pub async fn close(&self) -> WorkerStatus {
        let mut final_status = self.final_status.lock().await;
        if let Some(status) = final_status.as_ref() {
            return status.clone();
        }

        let grace = self.config.shutdown_grace;
        if !self.mux.is_closed() {
            debug!(pid = self.pid(), "Requesting worker shutdown");
            if let Err(e) = self.mux.call(SHUTDOWN_METHOD, Value::Null, Some(grace)).await {
                debug!(pid = self.pid(), error = %e, "Shutdown request not acknowledged");
            }
        }

        if tokio::time::timeout(grace, self.mux.close(CloseReason::ClientClosed))
            .await
            .is_err()
        {
            warn!(pid = self.pid(), "Timed out flushing frames to worker");
            self.mux.abort(CloseReason::ClientClosed);
        }

        let status = self.worker.terminate(grace).await;
        self.exit_watch.abort();
        info!(pid = self.pid(), status = %status, "Worker closed");

        *final_status = Some(status.clone());
        status
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.exit_watch.abort();
    }
}

/// Fails pending calls as soon as the worker process is gone.
async fn fail_calls_on_exit(
    mut status: watch::Receiver<WorkerStatus>,
    mux: Weak<CallMultiplexer>,
) {
    let status = match status.wait_for(|s| s.state.is_terminated()).await {
        Ok(status) => status.clone(),
        Err(_) => return,
    };
    if let Some(mux) = mux.upgrade() {
        mux.abort(CloseReason::WorkerExited(status.to_string()));
    }
}
