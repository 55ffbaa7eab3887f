//! Worker-side facade.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use tinyipc_protocol::Transport;

use crate::config::ServerConfig;
use crate::dispatch::DispatchLoop;
use crate::error::ServerResult;
use crate::registry::{Handler, HandlerError, HandlerRegistry};
use crate::signals::{ShutdownHandle, SignalHandler};

/// Serves registered methods to the host that launched this process.
///
/// ```ignore
/// let mut server = IpcServer::new(ServerConfig::default());
/// server.register("echo", |params: Value| async move { Ok::<_, HandlerError>(params) });
/// server.serve_stdio().await?;
/// ```
#[derive(Debug)]
pub struct IpcServer {
    config: ServerConfig,
    registry: HandlerRegistry,
    shutdown: ShutdownHandle,
    signals: SignalHandler,
}

impl IpcServer {
    /// Creates a server with no methods.
    pub fn new(config: ServerConfig) -> Self {
        let signals = SignalHandler::new();
        Self {
            config,
            registry: HandlerRegistry::new(),
            shutdown: signals.shutdown_handle(),
            signals,
        }
    }

    /// Registers a handler taking and returning raw JSON.
    pub fn register<H: Handler>(&mut self, method: impl Into<String>, handler: H) -> &mut Self {
        self.registry.register(method, handler);
        self
    }

    /// Registers a handler taking and returning serde types.
    pub fn register_typed<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.registry.register_typed(method, handler);
        self
    }

    /// Returns the handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Returns a handle that stops the server from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves requests on `transport` until the host disconnects, asks for
    /// shutdown, or the server is stopped.
    pub async fn serve(self, transport: Transport) -> ServerResult<()> {
        self.config.validate()?;
        if self.config.handle_signals {
            self.signals.spawn_listener()?;
        }

        info!(methods = ?self.registry.methods(), "Serving");
        let dispatch = DispatchLoop::new(Arc::new(self.registry), self.config, self.shutdown);
        dispatch.run(transport).await
    }

    /// Serves requests on this process's stdin and stdout.
    pub async fn serve_stdio(self) -> ServerResult<()> {
        self.serve(Transport::stdio()).await
    }
}
