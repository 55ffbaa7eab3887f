//! Method handlers and the registry mapping names to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use tinyipc_protocol::{ErrorCode, ErrorInfo, SHUTDOWN_METHOD};

/// Result type returned by handlers.
pub type HandlerResult = Result<Value, HandlerError>;

/// An error a handler reports to the caller.
///
/// It crosses the process boundary as an ERROR frame and never stops the
/// worker.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    /// Error kind tag.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    pub data: Option<Value>,
}

impl HandlerError {
    /// Creates an error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The parameters were missing or malformed.
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadParams, message)
    }

    /// The handler failed unexpectedly.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// An application-defined error kind.
    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::from(kind.into()), message)
    }

    /// Attaches structured details.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_params(err.to_string())
    }
}

impl From<HandlerError> for ErrorInfo {
    fn from(err: HandlerError) -> Self {
        ErrorInfo {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// An async method implementation.
///
/// Implemented for every `Fn(Value) -> impl Future<Output = HandlerResult>`,
/// so plain async closures can be registered directly.
pub trait Handler: Send + Sync + 'static {
    /// Runs the method with the request payload.
    fn call(&self, params: Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, params: Value) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(params))
    }
}

/// Method name to handler mapping.
///
/// Filled before serving, then shared read-only by the dispatch loop.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `method`, replacing any previous one.
    pub fn register<H: Handler>(&mut self, method: impl Into<String>, handler: H) -> &mut Self {
        let method = method.into();
        if method == SHUTDOWN_METHOD {
            warn!(method = %method, "Reserved method is answered by the server, handler ignored");
            return self;
        }
        if self.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            debug!(method = %method, "Replaced existing handler");
        }
        self
    }

    /// Registers a handler taking and returning serde types.
    ///
    /// Parameters that do not deserialize into `P` are answered with
    /// `E_BAD_PARAMS` without calling the handler.
    pub fn register_typed<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params: Value| {
            let handler = handler.clone();
            async move {
                let params: P = serde_json::from_value(params)?;
                let result = handler(params).await?;
                serde_json::to_value(result)
                    .map_err(|e| HandlerError::internal(format!("failed to encode result: {e}")))
            }
        })
    }

    /// Returns the handler for `method`.
    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    /// Returns true if `method` has a handler.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Returns the registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Returns the number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    async fn echo(params: Value) -> HandlerResult {
        Ok(params)
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", echo)
            .register_typed("add", |p: AddParams| async move {
                Ok::<_, HandlerError>(p.a + p.b)
            });
        registry
    }

    #[tokio::test]
    async fn dynamic_handler() {
        let handler = registry().get("echo").unwrap();
        let result = handler.call(json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn typed_handler() {
        let handler = registry().get("add").unwrap();
        assert_eq!(handler.call(json!({"a": 2, "b": 3})).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_params() {
        let handler = registry().get("add").unwrap();
        let err = handler.call(json!({"a": "two"})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadParams);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn lookup_and_listing() {
        let registry = registry();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("nope"));
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.methods(), vec!["add", "echo"]);
        assert_eq!(registry.len(), 2);
        assert!(HandlerRegistry::new().is_empty());
    }

    #[test]
    fn reserved_method_is_not_registered() {
        let mut registry = HandlerRegistry::new();
        registry.register(SHUTDOWN_METHOD, |_: Value| async { Ok::<_, HandlerError>(Value::Null) });
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_error_conversions() {
        let err = HandlerError::custom("E_QUOTA", "too many").with_data(json!({"limit": 3}));
        assert_eq!(err.to_string(), "E_QUOTA: too many");

        let info = ErrorInfo::from(err);
        assert_eq!(info.code, ErrorCode::Custom("E_QUOTA".into()));
        assert_eq!(info.data, Some(json!({"limit": 3})));

        let err = HandlerError::internal("boom");
        assert_eq!(err.code, ErrorCode::Internal);
    }
}
