//! The interpreter loop and per-state-type handlers.
//!
//! `StateRunner` walks one `StateGraph` from `StartAt` until a terminal
//! outcome. Parallel branches and Map iterations re-enter `run_graph` on
//! their own sub-graph, spawned onto a `JoinSet` with a child cancellation
//! token, so cancelling the parent reaches every nested suspension point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aslrun_types::definition::{
    FailState, MapState, ParallelState, PassState, State, StateGraph, TaskState, WaitState,
};
use aslrun_types::error::{ErrorRecord, error_kind};
use aslrun_types::event::ExecutionEvent;
use aslrun_types::execution::ExecutionId;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::choice;
use crate::context::ExecutionContext;
use crate::dataflow;
use crate::event::EventBus;
use crate::retry::{Recovery, RetryCounters, RetryHandler, saturating_millis};
use crate::task::TaskHandlerRegistry;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a state (or a whole graph) did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StateError {
    /// A failure that retriers and catchers may handle.
    Failed(ErrorRecord),
    /// The run was aborted or timed out; bypasses retry and catch.
    Cancelled,
}

impl From<ErrorRecord> for StateError {
    fn from(err: ErrorRecord) -> Self {
        StateError::Failed(err)
    }
}

/// Where the interpreter goes after a state completes.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Next { state: String, output: Value },
    End(Value),
}

fn transition(next: Option<&str>, end: bool, output: Value) -> Result<Outcome, StateError> {
    if end {
        return Ok(Outcome::End(output));
    }
    match next {
        Some(next) => Ok(Outcome::Next {
            state: next.to_string(),
            output,
        }),
        None => Err(ErrorRecord::runtime("state has neither 'Next' nor 'End'").into()),
    }
}

/// Await `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, StateError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StateError::Cancelled),
        out = fut => Ok(out),
    }
}

// ---------------------------------------------------------------------------
// StateRunner
// ---------------------------------------------------------------------------

/// Everything one execution needs to run states. Shared by `Arc` between
/// the top-level loop and every branch or iteration it spawns.
#[derive(Debug)]
pub(crate) struct StateRunner {
    pub execution_id: ExecutionId,
    pub tasks: TaskHandlerRegistry,
    pub wait_overrides: HashMap<String, u64>,
    pub events: EventBus,
}

impl StateRunner {
    /// Run `graph` from its start state until it ends.
    pub fn run_graph(
        self: Arc<Self>,
        graph: Arc<StateGraph>,
        input: Value,
        mut context: ExecutionContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, StateError>> {
        Box::pin(async move {
            let mut current = graph.start_at.clone();
            let mut data = input;

            loop {
                if cancel.is_cancelled() {
                    return Err(StateError::Cancelled);
                }

                let state = graph.state(&current).ok_or_else(|| {
                    ErrorRecord::runtime(format!("state '{current}' is not defined"))
                })?;

                context.enter_state(&current);
                tracing::debug!(
                    execution_id = %self.execution_id,
                    state = current.as_str(),
                    state_type = state.type_name(),
                    "entering state"
                );
                self.events.publish(ExecutionEvent::StateEntered {
                    execution_id: self.execution_id,
                    state_name: current.clone(),
                    state_type: state.type_name().to_string(),
                    input: data.clone(),
                });

                let outcome = self
                    .run_state(&current, state, data, &mut context, &cancel)
                    .await?;

                let output = match &outcome {
                    Outcome::Next { output, .. } | Outcome::End(output) => output.clone(),
                };
                self.events.publish(ExecutionEvent::StateExited {
                    execution_id: self.execution_id,
                    state_name: current.clone(),
                    output,
                });

                match outcome {
                    Outcome::Next { state, output } => {
                        current = state;
                        data = output;
                    }
                    Outcome::End(output) => return Ok(output),
                }
            }
        })
    }

    async fn run_state(
        self: &Arc<Self>,
        name: &str,
        state: &State,
        raw_input: Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Outcome, StateError> {
        match state {
            State::Succeed(s) => {
                let effective = dataflow::apply_input_path(&s.input_path, &raw_input, ctx.value())?;
                let output = dataflow::apply_output_path(&s.output_path, &effective, ctx.value())?;
                Ok(Outcome::End(output))
            }
            State::Fail(s) => Err(fail_record(s, &raw_input, ctx.value())?.into()),
            State::Choice(s) => {
                let effective = dataflow::apply_input_path(&s.input_path, &raw_input, ctx.value())?;
                let next = choice::select_next(&s.choices, s.default.as_deref(), &effective, ctx.value())?;
                let output = dataflow::apply_output_path(&s.output_path, &effective, ctx.value())?;
                Ok(Outcome::Next {
                    state: next.to_string(),
                    output,
                })
            }
            State::Pass(s) => {
                let output = run_pass(s, &raw_input, ctx.value())?;
                transition(s.next.as_deref(), s.end, output)
            }
            State::Wait(s) => {
                let output = self.run_wait(name, s, &raw_input, ctx, cancel).await?;
                transition(s.next.as_deref(), s.end, output)
            }
            State::Task(_) | State::Parallel(_) | State::Map(_) => {
                self.run_recoverable(name, state, &raw_input, ctx, cancel).await
            }
        }
    }

    /// Run a Task, Parallel or Map state under its Retry and Catch rules.
    async fn run_recoverable(
        self: &Arc<Self>,
        name: &str,
        state: &State,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Outcome, StateError> {
        let retriers = state.retriers();
        let mut counters = RetryCounters::new(retriers.len());

        loop {
            let error = match self.attempt(name, state, raw_input, ctx, cancel).await {
                Ok(output) => {
                    let (next, end) = state.transition().unwrap_or((None, false));
                    return transition(next, end, output);
                }
                Err(StateError::Cancelled) => return Err(StateError::Cancelled),
                Err(StateError::Failed(error)) => error,
            };

            match RetryHandler::resolve(retriers, state.catchers(), error.clone(), raw_input, &mut counters) {
                Recovery::Retry { attempt, delay } => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        state = name,
                        error = %error,
                        attempt,
                        delay_ms = saturating_millis(delay),
                        "retrying state"
                    );
                    self.events.publish(ExecutionEvent::StateRetried {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        error,
                        attempt,
                        delay_ms: saturating_millis(delay),
                    });
                    cancellable(cancel, tokio::time::sleep(delay)).await?;
                    ctx.set_retry_count(counters.total());
                }
                Recovery::Catch { next, output } => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        state = name,
                        error = %error,
                        next = next.as_str(),
                        "caught state error"
                    );
                    self.events.publish(ExecutionEvent::StateCaught {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        error,
                        next: next.clone(),
                    });
                    return Ok(Outcome::Next { state: next, output });
                }
                Recovery::Propagate(error) => return Err(error.into()),
            }
        }
    }

    /// One invocation of a recoverable state, all data-flow stages included.
    async fn attempt(
        self: &Arc<Self>,
        name: &str,
        state: &State,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StateError> {
        match state {
            State::Task(s) => self.run_task(name, s, raw_input, ctx, cancel).await,
            State::Parallel(s) => self.run_parallel(name, s, raw_input, ctx, cancel).await,
            State::Map(s) => self.run_map(name, s, raw_input, ctx, cancel).await,
            other => Err(ErrorRecord::runtime(format!(
                "{} states have no retry semantics",
                other.type_name()
            ))
            .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn run_task(
        &self,
        name: &str,
        s: &TaskState,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StateError> {
        let effective = dataflow::apply_input_path(&s.input_path, raw_input, ctx.value())?;
        let timeout = task_timeout(s, &effective, ctx.value())?;
        let parameters = dataflow::apply_parameters(s.parameters.as_ref(), effective, ctx.value())?;

        let handler = self.tasks.resolve(name, &s.resource).ok_or_else(|| {
            ErrorRecord::task_failed(format!(
                "no handler registered for state '{name}' or resource '{}'",
                s.resource
            ))
        })?;

        ctx.issue_task_token();
        let invocation = handler.invoke_boxed(parameters);
        let result = match timeout {
            Some(limit) => cancellable(cancel, tokio::time::timeout(limit, invocation))
                .await?
                .map_err(|_| {
                    ErrorRecord::timeout(format!(
                        "task '{name}' did not complete within {} seconds",
                        limit.as_secs()
                    ))
                })?,
            None => cancellable(cancel, invocation).await?,
        }
        .map_err(ErrorRecord::from)?;

        let selected = dataflow::apply_result_selector(s.result_selector.as_ref(), result, ctx.value())?;
        let merged = dataflow::apply_result_path(&s.result_path, raw_input, selected)?;
        Ok(dataflow::apply_output_path(&s.output_path, &merged, ctx.value())?)
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    async fn run_wait(
        &self,
        name: &str,
        s: &WaitState,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StateError> {
        let effective = dataflow::apply_input_path(&s.input_path, raw_input, ctx.value())?;
        let delay = match self.wait_overrides.get(name) {
            Some(ms) => Duration::from_millis(*ms),
            None => wait_delay(s, &effective, ctx.value())?,
        };

        tracing::debug!(
            execution_id = %self.execution_id,
            state = name,
            delay_ms = saturating_millis(delay),
            "waiting"
        );
        cancellable(cancel, tokio::time::sleep(delay)).await?;

        Ok(dataflow::apply_output_path(&s.output_path, &effective, ctx.value())?)
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(
        self: &Arc<Self>,
        name: &str,
        s: &ParallelState,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StateError> {
        let effective = dataflow::apply_input_path(&s.input_path, raw_input, ctx.value())?;
        let branch_input = dataflow::apply_parameters(s.parameters.as_ref(), effective, ctx.value())?;

        let branch_cancel = cancel.child_token();
        let _guard = branch_cancel.clone().drop_guard();
        let mut join_set = JoinSet::new();

        for (index, branch) in s.branches.iter().enumerate() {
            self.events.publish(ExecutionEvent::BranchStarted {
                execution_id: self.execution_id,
                state_name: name.to_string(),
                index,
            });
            let run = Arc::clone(self).run_graph(
                Arc::clone(branch),
                branch_input.clone(),
                ctx.clone(),
                branch_cancel.clone(),
            );
            join_set.spawn(async move { (index, run.await) });
        }

        let mut results = vec![Value::Null; s.branches.len()];
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = joined
                .map_err(|e| ErrorRecord::runtime(format!("parallel branch task failed: {e}")))?;
            match outcome {
                Ok(value) => {
                    results[index] = value;
                    self.events.publish(ExecutionEvent::BranchSucceeded {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        index,
                    });
                }
                Err(StateError::Cancelled) => return Err(StateError::Cancelled),
                Err(StateError::Failed(error)) => {
                    tracing::debug!(
                        execution_id = %self.execution_id,
                        state = name,
                        branch = index,
                        error = %error,
                        "parallel branch failed, cancelling siblings"
                    );
                    self.events.publish(ExecutionEvent::BranchFailed {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        index,
                        error: error.clone(),
                    });
                    return Err(error.wrapping(error_kind::BRANCH_FAILED).into());
                }
            }
        }

        let selected =
            dataflow::apply_result_selector(s.result_selector.as_ref(), Value::Array(results), ctx.value())?;
        let merged = dataflow::apply_result_path(&s.result_path, raw_input, selected)?;
        Ok(dataflow::apply_output_path(&s.output_path, &merged, ctx.value())?)
    }

    // -----------------------------------------------------------------------
    // Map
    // -----------------------------------------------------------------------

    async fn run_map(
        self: &Arc<Self>,
        name: &str,
        s: &MapState,
        raw_input: &Value,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StateError> {
        let effective = dataflow::apply_input_path(&s.input_path, raw_input, ctx.value())?;
        let items = dataflow::select_items(s.items_path.as_deref(), &effective, ctx.value())?;

        let total = items.len();
        let limit = match s.max_concurrency {
            None | Some(0) => total.max(1),
            Some(n) => n as usize,
        };

        let iteration_cancel = cancel.child_token();
        let _guard = iteration_cancel.clone().drop_guard();
        let mut join_set = JoinSet::new();
        let mut pending = items.into_iter().enumerate();
        let mut results = vec![Value::Null; total];

        loop {
            while join_set.len() < limit {
                let Some((index, item)) = pending.next() else {
                    break;
                };
                let item_ctx = ctx.for_map_item(index, &item);
                let item_input =
                    dataflow::apply_item_selector(s.item_selector.as_ref(), item, &effective, item_ctx.value())?;

                self.events.publish(ExecutionEvent::MapIterationStarted {
                    execution_id: self.execution_id,
                    state_name: name.to_string(),
                    index,
                });
                let run = Arc::clone(self).run_graph(
                    Arc::clone(&s.item_processor),
                    item_input,
                    item_ctx,
                    iteration_cancel.clone(),
                );
                join_set.spawn(async move { (index, run.await) });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (index, outcome) =
                joined.map_err(|e| ErrorRecord::runtime(format!("map iteration task failed: {e}")))?;
            match outcome {
                Ok(value) => {
                    results[index] = value;
                    self.events.publish(ExecutionEvent::MapIterationSucceeded {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        index,
                    });
                }
                Err(StateError::Cancelled) => return Err(StateError::Cancelled),
                Err(StateError::Failed(error)) => {
                    self.events.publish(ExecutionEvent::MapIterationFailed {
                        execution_id: self.execution_id,
                        state_name: name.to_string(),
                        index,
                        error: error.clone(),
                    });
                    return Err(error.wrapping(error_kind::BRANCH_FAILED).into());
                }
            }
        }

        let selected =
            dataflow::apply_result_selector(s.result_selector.as_ref(), Value::Array(results), ctx.value())?;
        let merged = dataflow::apply_result_path(&s.result_path, raw_input, selected)?;
        Ok(dataflow::apply_output_path(&s.output_path, &merged, ctx.value())?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_pass(s: &PassState, raw_input: &Value, context: &Value) -> Result<Value, ErrorRecord> {
    let effective = dataflow::apply_input_path(&s.input_path, raw_input, context)?;
    let result = match &s.result {
        Some(result) => result.clone(),
        None => dataflow::apply_parameters(s.parameters.as_ref(), effective, context)?,
    };
    let merged = dataflow::apply_result_path(&s.result_path, raw_input, result)?;
    dataflow::apply_output_path(&s.output_path, &merged, context)
}

fn fail_record(s: &FailState, raw_input: &Value, context: &Value) -> Result<ErrorRecord, ErrorRecord> {
    let field = |literal: &Option<String>, path: &Option<String>, label: &str| -> Result<String, ErrorRecord> {
        match (literal, path) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(path)) => match dataflow::resolve_required(label, path, raw_input, context)? {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            },
            (None, None) => Ok(String::new()),
        }
    };
    Ok(ErrorRecord::new(
        field(&s.error, &s.error_path, "ErrorPath")?,
        field(&s.cause, &s.cause_path, "CausePath")?,
    ))
}

fn task_timeout(s: &TaskState, effective: &Value, context: &Value) -> Result<Option<Duration>, ErrorRecord> {
    if let Some(secs) = s.timeout_seconds {
        return Ok(Some(Duration::from_secs(secs)));
    }
    let Some(path) = &s.timeout_seconds_path else {
        return Ok(None);
    };
    let value = dataflow::resolve_required("TimeoutSecondsPath", path, effective, context)?;
    match value.as_u64() {
        Some(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(ErrorRecord::runtime(format!(
            "TimeoutSecondsPath '{path}' must resolve to a positive integer, got {value}"
        ))),
    }
}

fn wait_delay(s: &WaitState, effective: &Value, context: &Value) -> Result<Duration, ErrorRecord> {
    if let Some(secs) = s.seconds {
        return Ok(Duration::from_secs(secs));
    }
    if let Some(ts) = &s.timestamp {
        return until(&Value::String(ts.clone()), "Timestamp");
    }
    if let Some(path) = &s.seconds_path {
        let value = dataflow::resolve_required("SecondsPath", path, effective, context)?;
        return value.as_u64().map(Duration::from_secs).ok_or_else(|| {
            ErrorRecord::runtime(format!(
                "SecondsPath '{path}' must resolve to a non-negative integer, got {value}"
            ))
        });
    }
    if let Some(path) = &s.timestamp_path {
        let value = dataflow::resolve_required("TimestampPath", path, effective, context)?;
        return until(&value, "TimestampPath");
    }
    Err(ErrorRecord::runtime(
        "Wait state must specify Seconds, Timestamp, SecondsPath or TimestampPath",
    ))
}

/// Time remaining until an RFC 3339 timestamp; zero if it has passed.
fn until(value: &Value, field: &str) -> Result<Duration, ErrorRecord> {
    let target = choice::parse_timestamp(value)
        .ok_or_else(|| ErrorRecord::runtime(format!("{field} {value} is not an RFC 3339 timestamp")))?;
    Ok((target.with_timezone(&Utc) - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
