//! Demo worker: serves `ping`, `echo`, `add` and `sleep` on stdin/stdout.

use tracing::error;

use tinyipc_core::tracing::{TracingConfig, init_tracing};
use tinyipc_demo::handlers;
use tinyipc_server::{IpcServer, ServerConfig};

#[tokio::main]
async fn main() {
    let logging = TracingConfig::worker().with_format_from_env();
    if let Err(e) = logging.and_then(init_tracing) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let mut server = IpcServer::new(ServerConfig::default().with_handle_signals(true));
    handlers::register_demo(&mut server);

    let code = match server.serve_stdio().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Worker failed");
            1
        }
    };

    // A stdin read may still be parked on a blocking thread, which would
    // keep the runtime from shutting down.
    std::process::exit(code);
}
