//! Demo parent: launches a worker and calls it.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::{Level, info, warn};

use tinyipc_core::tracing::{TracingConfig, init_tracing};
use tinyipc_core::{CallError, Client};
use tinyipc_demo::cli::{Cli, Command};
use tinyipc_demo::config::{DemoConfig, sibling_binary};
use tinyipc_demo::error::DemoResult;
use tinyipc_demo::handlers::Sum;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = if cli.debug {
        TracingConfig::host().with_level(Level::DEBUG)
    } else {
        TracingConfig::host()
    };
    if let Err(e) = tracing_config.with_format_from_env().and_then(init_tracing) {
        eprintln!("failed to initialize tracing: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> DemoResult<()> {
    let config = match &cli.config {
        Some(path) => DemoConfig::load_from(path)?,
        None => DemoConfig::default(),
    };

    let spec = config.launch_spec(cli.worker.as_deref(), || sibling_binary("tinyipc-worker"))?;
    let client = Arc::new(Client::open(&spec, config.client_config(cli.timeout_ms))?);

    let result = match cli.command {
        Some(Command::Call { method, params }) => call(&client, &method, &params).await,
        Some(Command::Bench { calls }) => bench(&client, calls).await,
        None => demo(&client).await,
    };

    let status = client.close().await;
    info!(status = %status, "Worker finished");
    result
}

async fn call(client: &Client, method: &str, params: &str) -> DemoResult<()> {
    let params: Value = serde_json::from_str(params)?;
    let result = client.call(method, params, None).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn demo(client: &Client) -> DemoResult<()> {
    let pong = client.call("ping", Value::Null, None).await?;
    println!("ping -> {pong}");

    let sum: Sum = client.call_as("add", &json!({"a": 7, "b": 5}), None).await?;
    println!("add -> {}", sum.sum);

    let echoed = client.call("echo", json!({"x": 1}), None).await?;
    println!("echo -> {echoed}");

    match client.call("nope", Value::Null, None).await {
        Err(CallError::UnknownMethod { message }) => println!("nope -> unknown method ({message})"),
        other => warn!(result = ?other, "Unexpected answer to an unknown method"),
    }

    Ok(())
}

async fn bench(client: &Arc<Client>, calls: usize) -> DemoResult<()> {
    let start = Instant::now();
    let results = join_all((0..calls).map(|i| {
        let client = client.clone();
        async move { client.call("echo", json!(i), None).await }
    }))
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    let elapsed = start.elapsed();
    println!(
        "{calls} calls in {:.1}ms ({failed} failed)",
        elapsed.as_secs_f64() * 1000.0
    );
    if let Some(Err(e)) = results.into_iter().find(Result::is_err) {
        return Err(e.into());
    }
    Ok(())
}
