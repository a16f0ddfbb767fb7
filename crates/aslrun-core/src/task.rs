//! Local task handlers.
//!
//! `TaskHandler` is the seam between Task states and caller code. It uses
//! RPITIT, so it cannot be a trait object directly; `TaskHandlerDyn` is the
//! object-safe twin with a blanket impl, and `TaskHandlerRegistry` stores
//! handlers as `Arc<dyn TaskHandlerDyn>` keyed by state name or resource.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use aslrun_types::error::{ErrorRecord, error_kind};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Error raised by a task handler.
///
/// `error` is the error name retriers and catchers match on. Any name other
/// than `States.Timeout` also matches `States.TaskFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}: {cause}")]
pub struct TaskError {
    pub error: String,
    pub cause: String,
}

impl TaskError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    /// A generic `States.TaskFailed` error.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::new(error_kind::TASK_FAILED, cause)
    }
}

impl From<TaskError> for ErrorRecord {
    fn from(err: TaskError) -> Self {
        let record = ErrorRecord::new(err.error, err.cause);
        if record.error == error_kind::TIMEOUT {
            record
        } else {
            record.wrapping(error_kind::TASK_FAILED)
        }
    }
}

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// A locally supplied implementation of a Task state's resource.
pub trait TaskHandler: Send + Sync {
    /// Invoke the handler with the state's effective input.
    fn invoke(&self, input: Value) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with a boxed future.
pub trait TaskHandlerDyn: Send + Sync {
    fn invoke_boxed(&self, input: Value) -> BoxFuture<'_, Result<Value, TaskError>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn invoke_boxed(&self, input: Value) -> BoxFuture<'_, Result<Value, TaskError>> {
        Box::pin(self.invoke(input))
    }
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnTaskHandler<F> {
    f: F,
}

/// Wrap `f` as a task handler.
///
/// ```ignore
/// registry.register("Double", task_fn(|input| async move {
///     Ok(json!(input.as_i64().unwrap_or(0) * 2))
/// }));
/// ```
pub fn task_fn<F, Fut>(f: F) -> FnTaskHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    FnTaskHandler { f }
}

impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    fn invoke(&self, input: Value) -> impl Future<Output = Result<Value, TaskError>> + Send {
        (self.f)(input)
    }
}

// ---------------------------------------------------------------------------
// TaskHandlerRegistry
// ---------------------------------------------------------------------------

/// Mapping from state name or resource identifier to a handler.
#[derive(Clone, Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandlerDyn>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`, replacing any previous entry.
    pub fn register<H: TaskHandler + 'static>(&mut self, key: impl Into<String>, handler: H) {
        self.handlers.insert(key.into(), Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, key: impl Into<String>, handler: Arc<dyn TaskHandlerDyn>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<H: TaskHandler + 'static>(mut self, key: impl Into<String>, handler: H) -> Self {
        self.register(key, handler);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TaskHandlerDyn>> {
        self.handlers.get(key).cloned()
    }

    /// Find the handler for a Task state: the state name first (a local
    /// override), then its resource.
    pub fn resolve(&self, state_name: &str, resource: &str) -> Option<Arc<dyn TaskHandlerDyn>> {
        self.get(state_name).or_else(|| self.get(resource))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("TaskHandlerRegistry")
            .field("keys", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl TaskHandler for Echo {
        async fn invoke(&self, input: Value) -> Result<Value, TaskError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_struct_handler_through_dyn() {
        let handler: Arc<dyn TaskHandlerDyn> = Arc::new(Echo);
        let out = handler.invoke_boxed(json!({ "a": 1 })).await.unwrap();
        assert_eq!(out, json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let registry = TaskHandlerRegistry::new().with(
            "Double",
            task_fn(|input: Value| async move { Ok(json!(input.as_i64().unwrap_or(0) * 2)) }),
        );
        let handler = registry.get("Double").unwrap();
        assert_eq!(handler.invoke_boxed(json!(21)).await.unwrap(), json!(42));
    }

    #[test]
    fn test_resolve_prefers_state_name() {
        let registry = TaskHandlerRegistry::new()
            .with("arn:aws:lambda:::function:f", Echo)
            .with("MyState", Echo);
        assert!(registry.resolve("MyState", "other").is_some());
        assert!(registry.resolve("Other", "arn:aws:lambda:::function:f").is_some());
        assert!(registry.resolve("Other", "missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_task_error_wraps_task_failed() {
        let record: ErrorRecord = TaskError::new("PaymentDeclined", "card expired").into();
        assert!(record.matches("PaymentDeclined"));
        assert!(record.matches(error_kind::TASK_FAILED));

        let timeout: ErrorRecord = TaskError::new(error_kind::TIMEOUT, "slow").into();
        assert!(!timeout.matches(error_kind::TASK_FAILED));

        let failed: ErrorRecord = TaskError::failed("x").into();
        assert_eq!(failed.error, error_kind::TASK_FAILED);
        assert!(failed.wrapped.is_empty());
    }
}
