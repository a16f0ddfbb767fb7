//! Execution controller: one spawned task per run.
//!
//! `start` spawns the interpreter loop onto the tokio runtime and returns an
//! `ExecutionHandle`. The handle owns the run's abort token; the run-wide
//! `TimeoutSeconds` deadline and `abort()` both settle the run and cancel the
//! token tree that every nested branch and iteration is parented to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aslrun_types::definition::StateMachineDefinition;
use aslrun_types::error::ErrorRecord;
use aslrun_types::event::ExecutionEvent;
use aslrun_types::execution::{ExecutionId, ExecutionStatus};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::event::EventBus;
use crate::runner::{StateError, StateRunner};
use crate::task::{TaskHandler, TaskHandlerRegistry};

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// How a run ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// An error escaped every retrier and catcher.
    #[error("execution failed: {0}")]
    Failed(ErrorRecord),

    /// The run-wide `TimeoutSeconds` elapsed.
    #[error("execution timed out: {0}")]
    TimedOut(ErrorRecord),

    /// The caller aborted the run.
    #[error("execution aborted")]
    Aborted,
}

impl ExecutionError {
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            ExecutionError::Failed(record) | ExecutionError::TimedOut(record) => Some(record),
            ExecutionError::Aborted => None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionError::Failed(_) => ExecutionStatus::Failed,
            ExecutionError::TimedOut(_) => ExecutionStatus::TimedOut,
            ExecutionError::Aborted => ExecutionStatus::Aborted,
        }
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Local replacements for remote resources and real delays.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Task handlers keyed by state name or resource identifier.
    pub task_resource_local_handlers: TaskHandlerRegistry,
    /// Wait delays in milliseconds keyed by state name.
    pub wait_time_overrides: HashMap<String, u64>,
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Merged into the generated context object.
    pub context: Option<Value>,
    pub overrides: Overrides,
    /// Settle an aborted run with `Ok(null)` instead of `Err(Aborted)`.
    pub no_throw_on_abort: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_task_handler<H: TaskHandler + 'static>(mut self, key: impl Into<String>, handler: H) -> Self {
        self.overrides.task_resource_local_handlers.register(key, handler);
        self
    }

    pub fn with_task_handlers(mut self, handlers: TaskHandlerRegistry) -> Self {
        self.overrides.task_resource_local_handlers = handlers;
        self
    }

    pub fn with_wait_override(mut self, state: impl Into<String>, millis: u64) -> Self {
        self.overrides.wait_time_overrides.insert(state.into(), millis);
        self
    }

    pub fn no_throw_on_abort(mut self, enabled: bool) -> Self {
        self.no_throw_on_abort = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Caller's view of a running execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    abort: CancellationToken,
    status: watch::Receiver<ExecutionStatus>,
    events: Option<broadcast::Receiver<ExecutionEvent>>,
    bus: EventBus,
    task: JoinHandle<Result<Value, ExecutionError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Request cancellation. Idempotent; has no effect once the run settled.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// A token that aborts this run when cancelled.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// Event receiver for this run.
    ///
    /// The first call returns a receiver subscribed before the run started,
    /// so it sees `ExecutionStarted`. Later calls subscribe from now on.
    pub fn events(&mut self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.take().unwrap_or_else(|| self.bus.subscribe())
    }

    /// Wait for the run to settle.
    pub async fn result(self) -> Result<Value, ExecutionError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ExecutionError::Failed(ErrorRecord::runtime(format!(
                "execution task failed: {e}"
            )))),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

enum Settled {
    Succeeded(Value),
    Failed(ErrorRecord),
    TimedOut(u64),
    Aborted,
}

/// Spawn one execution of `definition`. Requires a tokio runtime.
pub(crate) fn start(
    definition: Arc<StateMachineDefinition>,
    state_machine_name: &str,
    input: Value,
    options: RunOptions,
) -> ExecutionHandle {
    let execution_id = ExecutionId::new();
    let bus = EventBus::default();
    let events = bus.subscribe();
    let abort = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);

    let context = ExecutionContext::new(execution_id, state_machine_name, &input, options.context.as_ref());
    let runner = Arc::new(StateRunner {
        execution_id,
        tasks: options.overrides.task_resource_local_handlers,
        wait_overrides: options.overrides.wait_time_overrides,
        events: bus.clone(),
    });

    let task = tokio::spawn(drive(
        runner,
        definition,
        input,
        context,
        abort.clone(),
        options.no_throw_on_abort,
        status_tx,
    ));

    ExecutionHandle {
        execution_id,
        abort,
        status: status_rx,
        events: Some(events),
        bus,
        task,
    }
}

async fn drive(
    runner: Arc<StateRunner>,
    definition: Arc<StateMachineDefinition>,
    input: Value,
    context: ExecutionContext,
    abort: CancellationToken,
    no_throw_on_abort: bool,
    status: watch::Sender<ExecutionStatus>,
) -> Result<Value, ExecutionError> {
    let execution_id = runner.execution_id;
    let started = Instant::now();

    tracing::info!(
        execution_id = %execution_id,
        start_at = definition.graph.start_at.as_str(),
        "execution started"
    );
    runner.events.publish(ExecutionEvent::ExecutionStarted {
        execution_id,
        input: input.clone(),
    });

    let run_cancel = abort.child_token();
    let run = Arc::clone(&runner).run_graph(
        Arc::clone(&definition.graph),
        input,
        context,
        run_cancel.clone(),
    );
    let timeout_seconds = definition.timeout_seconds;
    let deadline = async move {
        match timeout_seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let settled = tokio::select! {
        biased;
        _ = abort.cancelled() => Settled::Aborted,
        _ = deadline => Settled::TimedOut(timeout_seconds.unwrap_or_default()),
        result = run => match result {
            Ok(output) => Settled::Succeeded(output),
            Err(StateError::Failed(error)) => Settled::Failed(error),
            Err(StateError::Cancelled) => Settled::Aborted,
        },
    };
    run_cancel.cancel();

    let duration_ms = started.elapsed().as_millis() as u64;
    let (result, final_status, event) = match settled {
        Settled::Succeeded(output) => {
            tracing::info!(execution_id = %execution_id, duration_ms, "execution succeeded");
            (
                Ok(output.clone()),
                ExecutionStatus::Succeeded,
                ExecutionEvent::ExecutionSucceeded {
                    execution_id,
                    output,
                    duration_ms,
                },
            )
        }
        Settled::Failed(error) => {
            tracing::info!(execution_id = %execution_id, error = %error, duration_ms, "execution failed");
            (
                Err(ExecutionError::Failed(error.clone())),
                ExecutionStatus::Failed,
                ExecutionEvent::ExecutionFailed { execution_id, error },
            )
        }
        Settled::TimedOut(secs) => {
            tracing::info!(execution_id = %execution_id, timeout_seconds = secs, "execution timed out");
            let error = ErrorRecord::timeout(format!("execution did not complete within {secs} seconds"));
            (
                Err(ExecutionError::TimedOut(error)),
                ExecutionStatus::TimedOut,
                ExecutionEvent::ExecutionTimedOut { execution_id },
            )
        }
        Settled::Aborted => {
            tracing::info!(execution_id = %execution_id, duration_ms, "execution aborted");
            let result = if no_throw_on_abort {
                Ok(Value::Null)
            } else {
                Err(ExecutionError::Aborted)
            };
            (
                result,
                ExecutionStatus::Aborted,
                ExecutionEvent::ExecutionAborted { execution_id },
            )
        }
    };

    status.send_replace(final_status);
    runner.events.publish(event);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> Arc<StateMachineDefinition> {
        Arc::new(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_execution_error_status_and_record() {
        let failed = ExecutionError::Failed(ErrorRecord::task_failed("x"));
        assert_eq!(failed.status(), ExecutionStatus::Failed);
        assert!(failed.record().is_some());

        let timed_out = ExecutionError::TimedOut(ErrorRecord::timeout("slow"));
        assert_eq!(timed_out.status(), ExecutionStatus::TimedOut);

        assert_eq!(ExecutionError::Aborted.status(), ExecutionStatus::Aborted);
        assert!(ExecutionError::Aborted.record().is_none());
        assert_eq!(ExecutionError::Aborted.to_string(), "execution aborted");
    }

    #[test]
    fn test_run_options_builder() {
        let options = RunOptions::new()
            .with_context(json!({ "Execution": { "Name": "custom" } }))
            .with_wait_override("Pause", 50)
            .no_throw_on_abort(true);
        assert_eq!(options.overrides.wait_time_overrides.get("Pause"), Some(&50));
        assert!(options.no_throw_on_abort);
        assert!(options.context.is_some());
        assert!(options.overrides.task_resource_local_handlers.is_empty());
    }

    #[tokio::test]
    async fn test_status_moves_from_running_to_succeeded() {
        let def = definition(json!({
            "StartAt": "P",
            "States": { "P": { "Type": "Pass", "End": true } }
        }));
        let handle = start(def, "Test", json!({ "a": 1 }), RunOptions::default());
        let mut status = handle.status.clone();
        let result = handle.result().await.unwrap();
        assert_eq!(result, json!({ "a": 1 }));
        assert_eq!(*status.borrow_and_update(), ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_context_seed_is_visible_to_states() {
        let def = definition(json!({
            "StartAt": "P",
            "States": {
                "P": { "Type": "Pass", "Parameters": { "name.$": "$$.Execution.Name" }, "End": true }
            }
        }));
        let options = RunOptions::new().with_context(json!({ "Execution": { "Name": "seeded" } }));
        let result = start(def, "Test", json!({}), options).result().await.unwrap();
        assert_eq!(result, json!({ "name": "seeded" }));
    }

    #[tokio::test]
    async fn test_events_start_with_execution_started() {
        let def = definition(json!({
            "StartAt": "P",
            "States": { "P": { "Type": "Pass", "End": true } }
        }));
        let mut handle = start(def, "Test", json!({}), RunOptions::default());
        let mut rx = handle.events();
        let id = handle.execution_id();
        handle.result().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            seen.first(),
            Some(ExecutionEvent::ExecutionStarted { execution_id, .. }) if *execution_id == id
        ));
        assert!(seen.last().is_some_and(ExecutionEvent::is_terminal));
    }
}
