//! Event types for the execution event bus.
//!
//! `ExecutionEvent` is broadcast while a run progresses. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorRecord;
use crate::execution::ExecutionId;

/// Events emitted during one execution.
///
/// Events raised inside a Parallel branch or Map iteration carry the same
/// `execution_id` as the parent run; `state_name` is unique only within its
/// own graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The execution has started.
    ExecutionStarted { execution_id: ExecutionId, input: Value },

    /// The execution settled successfully.
    ExecutionSucceeded {
        execution_id: ExecutionId,
        output: Value,
        duration_ms: u64,
    },

    /// The execution settled with an unhandled error.
    ExecutionFailed {
        execution_id: ExecutionId,
        error: ErrorRecord,
    },

    /// The execution was aborted by the caller.
    ExecutionAborted { execution_id: ExecutionId },

    /// The run-wide `TimeoutSeconds` elapsed.
    ExecutionTimedOut { execution_id: ExecutionId },

    // -- State lifecycle --

    /// A state has been entered.
    StateEntered {
        execution_id: ExecutionId,
        state_name: String,
        state_type: String,
        input: Value,
    },

    /// A state completed and produced its output.
    StateExited {
        execution_id: ExecutionId,
        state_name: String,
        output: Value,
    },

    /// A state failed and will be retried after `delay_ms`.
    StateRetried {
        execution_id: ExecutionId,
        state_name: String,
        error: ErrorRecord,
        attempt: u32,
        delay_ms: u64,
    },

    /// A state failure was handled by a catcher.
    StateCaught {
        execution_id: ExecutionId,
        state_name: String,
        error: ErrorRecord,
        next: String,
    },

    // -- Parallel / Map fan-out --

    /// A Parallel branch has started.
    BranchStarted {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
    },

    /// A Parallel branch completed successfully.
    BranchSucceeded {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
    },

    /// A Parallel branch failed.
    BranchFailed {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
        error: ErrorRecord,
    },

    /// A Map iteration has started.
    MapIterationStarted {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
    },

    /// A Map iteration completed successfully.
    MapIterationSucceeded {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
    },

    /// A Map iteration failed.
    MapIterationFailed {
        execution_id: ExecutionId,
        state_name: String,
        index: usize,
        error: ErrorRecord,
    },
}

impl ExecutionEvent {
    /// Whether this event settles the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionSucceeded { .. }
                | ExecutionEvent::ExecutionFailed { .. }
                | ExecutionEvent::ExecutionAborted { .. }
                | ExecutionEvent::ExecutionTimedOut { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_snake_case_tag() {
        let event = ExecutionEvent::StateEntered {
            execution_id: ExecutionId::new(),
            state_name: "Greet".into(),
            state_type: "Task".into(),
            input: json!({ "a": 1 }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("state_entered"));
        assert_eq!(value["state_name"], json!("Greet"));
    }

    #[test]
    fn test_terminal_events() {
        let id = ExecutionId::new();
        assert!(ExecutionEvent::ExecutionAborted { execution_id: id }.is_terminal());
        assert!(ExecutionEvent::ExecutionTimedOut { execution_id: id }.is_terminal());
        assert!(
            !ExecutionEvent::BranchStarted {
                execution_id: id,
                state_name: "P".into(),
                index: 0
            }
            .is_terminal()
        );
    }
}
