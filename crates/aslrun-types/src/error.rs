//! Structured state failures.
//!
//! An `ErrorRecord` is what every failing state, data-flow stage, or task
//! handler produces. Retriers and catchers match against it, and it is what a
//! failed execution ultimately surfaces to the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Reserved error names of the state language.
pub mod error_kind {
    /// Wildcard matching every error except `States.Runtime`.
    pub const ALL: &str = "States.ALL";
    /// Unrecoverable runtime failure (bad path, malformed value).
    pub const RUNTIME: &str = "States.Runtime";
    /// A state or the whole execution ran past its timeout.
    pub const TIMEOUT: &str = "States.Timeout";
    /// A task handler failed or could not be resolved.
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// No Choice rule matched and the state has no `Default`.
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// A `Parameters`/`ResultSelector`/`ItemSelector`/`ItemsPath` path did not resolve.
    pub const PARAMETER_PATH_FAILURE: &str = "States.ParameterPathFailure";
    /// `ResultPath` could not be applied to the state input.
    pub const RESULT_PATH_MATCH_FAILURE: &str = "States.ResultPathMatchFailure";
    /// An intrinsic function failed to evaluate.
    pub const INTRINSIC_FAILURE: &str = "States.IntrinsicFailure";
    /// A Parallel branch or Map iteration failed.
    pub const BRANCH_FAILED: &str = "States.BranchFailed";
}

/// A state failure: error name, human-readable cause, and the chain of
/// broader error names it also answers to.
///
/// Serializes as `{"Error": ..., "Cause": ...}`, which is exactly the payload a
/// catcher injects at its `ResultPath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error}: {cause}")]
pub struct ErrorRecord {
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Cause")]
    pub cause: String,
    /// Broader error names this record also matches (e.g. `States.TaskFailed`
    /// for a custom error raised by a task handler).
    #[serde(skip)]
    pub wrapped: Vec<String>,
}

impl ErrorRecord {
    /// Create a record with the given error name and cause.
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
            wrapped: Vec::new(),
        }
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(error_kind::RUNTIME, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(error_kind::TIMEOUT, cause)
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(error_kind::TASK_FAILED, cause)
    }

    pub fn parameter_path_failure(cause: impl Into<String>) -> Self {
        Self::new(error_kind::PARAMETER_PATH_FAILURE, cause)
    }

    pub fn result_path_match_failure(cause: impl Into<String>) -> Self {
        Self::new(error_kind::RESULT_PATH_MATCH_FAILURE, cause)
    }

    pub fn intrinsic_failure(cause: impl Into<String>) -> Self {
        Self::new(error_kind::INTRINSIC_FAILURE, cause)
    }

    /// Add a broader error name to the chain. Wrapping with the record's own
    /// name is a no-op.
    pub fn wrapping(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        if kind != self.error && !self.wrapped.contains(&kind) {
            self.wrapped.push(kind);
        }
        self
    }

    /// Whether an `ErrorEquals` entry matches this record.
    ///
    /// `States.ALL` matches everything except `States.Runtime`; any other
    /// name must equal the error itself or one of its wrapped names.
    pub fn matches(&self, name: &str) -> bool {
        if name == error_kind::ALL {
            return self.error != error_kind::RUNTIME;
        }
        self.error == name || self.wrapped.iter().any(|w| w == name)
    }

    /// The `{"Error", "Cause"}` payload injected by catchers.
    pub fn to_value(&self) -> Value {
        json!({ "Error": self.error, "Cause": self.cause })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_error_and_cause() {
        let err = ErrorRecord::new("CustomError", "something broke");
        assert_eq!(err.to_string(), "CustomError: something broke");
    }

    #[test]
    fn test_states_all_matches_everything_but_runtime() {
        assert!(ErrorRecord::task_failed("x").matches(error_kind::ALL));
        assert!(ErrorRecord::timeout("x").matches(error_kind::ALL));
        assert!(ErrorRecord::new("Custom", "x").matches(error_kind::ALL));
        assert!(!ErrorRecord::runtime("x").matches(error_kind::ALL));
    }

    #[test]
    fn test_wrapped_names_match() {
        let err = ErrorRecord::new("MyError", "bad").wrapping(error_kind::TASK_FAILED);
        assert!(err.matches("MyError"));
        assert!(err.matches(error_kind::TASK_FAILED));
        assert!(!err.matches(error_kind::TIMEOUT));
    }

    #[test]
    fn test_wrapping_with_own_name_is_noop() {
        let err = ErrorRecord::task_failed("x").wrapping(error_kind::TASK_FAILED);
        assert!(err.wrapped.is_empty());
    }

    #[test]
    fn test_serializes_as_error_and_cause() {
        let err = ErrorRecord::new("E", "C").wrapping("Other");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value, json!({ "Error": "E", "Cause": "C" }));
        assert_eq!(err.to_value(), value);
    }
}
