//! Methods served by the demo workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use tinyipc_server::{HandlerError, HandlerResult, IpcServer};

/// Parameters of `add`.
#[derive(Debug, Deserialize)]
pub struct AddParams {
    pub a: i64,
    pub b: i64,
}

/// Result of `add`.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    pub sum: i64,
}

/// Parameters of `sleep`.
#[derive(Debug, Deserialize)]
pub struct SleepParams {
    pub ms: u64,
}

/// Parameters of `die`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DieParams {
    pub code: i32,
}

pub async fn ping(_: Value) -> HandlerResult {
    Ok(json!("pong"))
}

pub async fn echo(params: Value) -> HandlerResult {
    Ok(params)
}

pub async fn add(params: AddParams) -> Result<Sum, HandlerError> {
    let sum = params
        .a
        .checked_add(params.b)
        .ok_or_else(|| HandlerError::bad_params("sum overflows i64"))?;
    Ok(Sum { sum })
}

pub async fn sleep(params: SleepParams) -> Result<&'static str, HandlerError> {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Ok("slept")
}

/// Writes to stderr while answering normally.
pub async fn noisy(_: Value) -> HandlerResult {
    for i in 0..50 {
        eprintln!("stderr: runtime noise {i}");
    }
    info!("noisy handler done");
    Ok(json!({"ok": true}))
}

/// Exits the process without answering.
pub async fn die(params: Option<DieParams>) -> Result<Value, HandlerError> {
    let code = params.unwrap_or_default().code;
    let code = if code == 0 { 1 } else { code };
    warn!(code, "Exiting on request");
    std::process::exit(code);
}

pub async fn bad_params(_: Value) -> HandlerResult {
    Err(HandlerError::bad_params("missing/invalid params"))
}

pub async fn panic(_: Value) -> HandlerResult {
    panic!("handler panicked on purpose");
}

/// Registers the methods of the demo worker.
pub fn register_demo(server: &mut IpcServer) {
    server
        .register("ping", ping)
        .register("echo", echo)
        .register_typed("add", add)
        .register_typed("sleep", sleep);
}

/// Registers the demo methods plus the misbehaving ones used in tests.
pub fn register_test(server: &mut IpcServer) {
    register_demo(server);
    server
        .register("noisy", noisy)
        .register_typed("die", die)
        .register("badParams", bad_params)
        .register("panic", panic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyipc_protocol::ErrorCode;
    use tinyipc_server::ServerConfig;

    #[tokio::test]
    async fn add_sums() {
        assert_eq!(add(AddParams { a: 7, b: 5 }).await, Ok(Sum { sum: 12 }));

        let err = add(AddParams { a: i64::MAX, b: 1 }).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadParams);
    }

    #[tokio::test]
    async fn bad_params_always_fails() {
        let err = bad_params(Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadParams);
        assert_eq!(err.message, "missing/invalid params");
    }

    #[test]
    fn registered_methods() {
        let mut server = IpcServer::new(ServerConfig::default());
        register_demo(&mut server);
        assert_eq!(server.registry().methods(), vec!["add", "echo", "ping", "sleep"]);

        let mut server = IpcServer::new(ServerConfig::default());
        register_test(&mut server);
        assert_eq!(server.registry().len(), 8);
        assert!(server.registry().contains("badParams"));
    }
}
