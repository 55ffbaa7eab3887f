//! Worker used by the integration tests.
//!
//! Serves the demo methods plus `noisy`, `die`, `badParams` and `panic`.

use tracing::{error, info};

use tinyipc_core::tracing::{TracingConfig, init_tracing};
use tinyipc_demo::handlers;
use tinyipc_server::{IpcServer, ServerConfig};

#[tokio::main]
async fn main() {
    let logging = TracingConfig::worker().with_format_from_env();
    if let Err(e) = logging.and_then(init_tracing) {
        eprintln!("failed to initialize tracing: {e}");
    }
    // Noise on stderr must never reach the protocol stream
    eprintln!("stderr: boot noise");

    let config = ServerConfig::default().with_handle_signals(true);
    let mut server = IpcServer::new(config);
    handlers::register_test(&mut server);

    let code = match server.serve_stdio().await {
        Ok(()) => {
            info!("Test worker done");
            0
        }
        Err(e) => {
            error!(error = %e, "Test worker failed");
            1
        }
    };
    std::process::exit(code);
}
