//! State machine definition types.
//!
//! `StateMachineDefinition` is the serde model of a state-language document.
//! States form a closed sum type (`State`) tagged by the `Type` field, so the
//! interpreter matches exhaustively and adding a state type is a
//! compile-checked change. Parallel branches and Map item processors are
//! nested `StateGraph`s held behind `Arc` so running branches can share them
//! without copying.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::choice::ChoiceRule;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A complete state machine definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachineDefinition {
    /// The top-level graph (`StartAt`, `States`, `Comment`).
    #[serde(flatten)]
    pub graph: Arc<StateGraph>,
    /// Run-wide timeout; exceeding it settles the execution as timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Language version string (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl StateMachineDefinition {
    /// Parse a definition from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A set of named states with a designated start state.
///
/// Used for the top-level definition, each Parallel branch, and each Map
/// item processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateGraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub start_at: String,
    pub states: BTreeMap<String, State>,
}

impl StateGraph {
    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

// ---------------------------------------------------------------------------
// PathSetting
// ---------------------------------------------------------------------------

/// A path-valued field that distinguishes "absent" from explicit `null`.
///
/// `InputPath`, `OutputPath` and `ResultPath` all default to `$` when absent,
/// but an explicit `null` means "discard" (empty input/output, or keep the
/// input and drop the result).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PathSetting {
    /// Field not present: behaves like `$`.
    #[default]
    Default,
    /// Field present with a JSON `null`.
    Null,
    /// Field present with a path string.
    Path(String),
}

impl PathSetting {
    pub fn is_default(&self) -> bool {
        matches!(self, PathSetting::Default)
    }

    /// The effective path string, treating `Default` as `$`.
    pub fn effective(&self) -> Option<&str> {
        match self {
            PathSetting::Default => Some("$"),
            PathSetting::Null => None,
            PathSetting::Path(p) => Some(p.as_str()),
        }
    }
}

impl Serialize for PathSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSetting::Default => serializer.serialize_str("$"),
            PathSetting::Null => serializer.serialize_none(),
            PathSetting::Path(p) => serializer.serialize_str(p),
        }
    }
}

impl<'de> Deserialize<'de> for PathSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<String>::deserialize(deserializer)? {
            None => PathSetting::Null,
            Some(p) => PathSetting::Path(p),
        })
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One state of a graph, tagged by its `Type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    Task(TaskState),
    Wait(WaitState),
    Choice(ChoiceState),
    Pass(PassState),
    Succeed(SucceedState),
    Fail(FailState),
    Parallel(ParallelState),
    Map(MapState),
}

impl State {
    /// The state language type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            State::Task(_) => "Task",
            State::Wait(_) => "Wait",
            State::Choice(_) => "Choice",
            State::Pass(_) => "Pass",
            State::Succeed(_) => "Succeed",
            State::Fail(_) => "Fail",
            State::Parallel(_) => "Parallel",
            State::Map(_) => "Map",
        }
    }

    /// `Next` and `End` for states that carry them; `None` for Choice,
    /// Succeed and Fail.
    pub fn transition(&self) -> Option<(Option<&str>, bool)> {
        match self {
            State::Task(s) => Some((s.next.as_deref(), s.end)),
            State::Wait(s) => Some((s.next.as_deref(), s.end)),
            State::Pass(s) => Some((s.next.as_deref(), s.end)),
            State::Parallel(s) => Some((s.next.as_deref(), s.end)),
            State::Map(s) => Some((s.next.as_deref(), s.end)),
            State::Choice(_) | State::Succeed(_) | State::Fail(_) => None,
        }
    }

    /// Retriers declared on this state (empty for types without `Retry`).
    pub fn retriers(&self) -> &[Retrier] {
        match self {
            State::Task(s) => &s.retry,
            State::Parallel(s) => &s.retry,
            State::Map(s) => &s.retry,
            _ => &[],
        }
    }

    /// Catchers declared on this state (empty for types without `Catch`).
    pub fn catchers(&self) -> &[Catcher] {
        match self {
            State::Task(s) => &s.catch,
            State::Parallel(s) => &s.catch,
            State::Map(s) => &s.catch,
            _ => &[],
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Invokes a locally registered handler for `Resource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub resource: String,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub result_path: PathSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds_path: Option<String>,
    /// Parsed for compatibility; local handlers are not required to heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Suspends for a fixed or path-derived duration, or until a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Branches on the first matching rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Applies data-flow stages only, optionally injecting a fixed `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub result_path: PathSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Ends the execution (or branch) successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
}

/// Ends the execution (or branch) with an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_path: Option<String>,
}

/// Runs every branch concurrently against the same input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub branches: Vec<Arc<StateGraph>>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub result_path: PathSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Runs the item processor once per element of the `ItemsPath` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(alias = "Iterator")]
    pub item_processor: Arc<StateGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    /// Per-item template; the legacy `Parameters` field means the same thing on Map.
    #[serde(default, alias = "Parameters", skip_serializing_if = "Option::is_none")]
    pub item_selector: Option<Value>,
    /// `None` or `0` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub input_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub output_path: PathSetting,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub result_path: PathSetting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

// ---------------------------------------------------------------------------
// Retry / Catch
// ---------------------------------------------------------------------------

/// A retry rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retrier {
    pub error_equals: Vec<String>,
    /// Delay before the first retry (default 1).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Total invocations allowed through this rule (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Multiplier applied to the delay on each subsequent retry (default 2.0).
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    /// Upper bound on any single retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<u64>,
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_interval_seconds() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// Randomization applied to retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JitterStrategy {
    /// Delay drawn uniformly from `[0, computed delay]`.
    Full,
    #[default]
    None,
}

/// A catch rule: redirect to `Next` with the error injected at `ResultPath`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Catcher {
    pub error_equals: Vec<String>,
    pub next: String,
    #[serde(default, skip_serializing_if = "PathSetting::is_default")]
    pub result_path: PathSetting,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HELLO: &str = r#"{
        "Comment": "hello",
        "StartAt": "Greet",
        "TimeoutSeconds": 30,
        "States": {
            "Greet": {
                "Type": "Task",
                "Resource": "arn:aws:lambda:us-east-1:123456789012:function:greet",
                "ResultPath": "$.greeting",
                "OutputPath": null,
                "Retry": [{ "ErrorEquals": ["States.ALL"] }],
                "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Oops" }],
                "Next": "Done"
            },
            "Oops": { "Type": "Fail", "Error": "Boom" },
            "Done": { "Type": "Succeed" }
        }
    }"#;

    #[test]
    fn test_parse_definition() {
        let def = StateMachineDefinition::from_json(HELLO).unwrap();
        assert_eq!(def.graph.start_at, "Greet");
        assert_eq!(def.graph.comment.as_deref(), Some("hello"));
        assert_eq!(def.timeout_seconds, Some(30));
        assert_eq!(def.graph.states.len(), 3);

        let State::Task(task) = def.graph.state("Greet").unwrap() else {
            panic!("expected Task");
        };
        assert_eq!(task.result_path, PathSetting::Path("$.greeting".into()));
        assert_eq!(task.output_path, PathSetting::Null);
        assert_eq!(task.input_path, PathSetting::Default);
        assert_eq!(task.next.as_deref(), Some("Done"));
        assert!(!task.end);
    }

    #[test]
    fn test_retrier_defaults() {
        let def = StateMachineDefinition::from_json(HELLO).unwrap();
        let retrier = &def.graph.state("Greet").unwrap().retriers()[0];
        assert_eq!(retrier.interval_seconds, 1);
        assert_eq!(retrier.max_attempts, 3);
        assert!((retrier.backoff_rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(retrier.jitter_strategy, JitterStrategy::None);
        assert!(retrier.max_delay_seconds.is_none());
    }

    #[test]
    fn test_catcher_result_path_defaults() {
        let def = StateMachineDefinition::from_json(HELLO).unwrap();
        let catcher = &def.graph.state("Greet").unwrap().catchers()[0];
        assert_eq!(catcher.next, "Oops");
        assert_eq!(catcher.result_path.effective(), Some("$"));
    }

    #[test]
    fn test_map_accepts_legacy_iterator_and_parameters() {
        let state: State = serde_json::from_value(json!({
            "Type": "Map",
            "ItemsPath": "$.items",
            "MaxConcurrency": 2,
            "Parameters": { "value.$": "$$.Map.Item.Value" },
            "Iterator": {
                "StartAt": "P",
                "States": { "P": { "Type": "Pass", "End": true } }
            },
            "End": true
        }))
        .unwrap();

        let State::Map(map) = state else {
            panic!("expected Map");
        };
        assert_eq!(map.items_path.as_deref(), Some("$.items"));
        assert_eq!(map.max_concurrency, Some(2));
        assert!(map.item_selector.is_some());
        assert_eq!(map.item_processor.start_at, "P");
    }

    #[test]
    fn test_transition_accessor() {
        let pass: State = serde_json::from_value(json!({ "Type": "Pass", "Next": "B" })).unwrap();
        assert_eq!(pass.transition(), Some((Some("B"), false)));

        let succeed: State = serde_json::from_value(json!({ "Type": "Succeed" })).unwrap();
        assert_eq!(succeed.transition(), None);
        assert_eq!(succeed.type_name(), "Succeed");
    }

    #[test]
    fn test_path_setting_serialization() {
        let pass = PassState {
            comment: None,
            input_path: PathSetting::Null,
            output_path: PathSetting::Default,
            result_path: PathSetting::Path("$.r".into()),
            parameters: None,
            result: None,
            next: None,
            end: true,
        };
        let value = serde_json::to_value(&pass).unwrap();
        assert_eq!(value["InputPath"], Value::Null);
        assert!(value.get("OutputPath").is_none());
        assert_eq!(value["ResultPath"], json!("$.r"));
        assert_eq!(value["End"], json!(true));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<State, _> = serde_json::from_value(json!({ "Type": "Teleport" }));
        assert!(result.is_err());
    }
}
