//! Structural validation of state machine definitions.
//!
//! `validate` walks the top-level graph and every nested Parallel branch and
//! Map item processor, collecting every problem it finds rather than stopping
//! at the first. Reachability uses a `petgraph` walk from `StartAt`.

use std::collections::HashMap;

use aslrun_types::choice::{Condition, Operand};
use aslrun_types::definition::{
    Catcher, PathSetting, Retrier, State, StateGraph, StateMachineDefinition,
};
use aslrun_types::error::error_kind;
use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use serde_json::Value;
use thiserror::Error;

use crate::dataflow;
use crate::intrinsic::{self, IntrinsicCall};

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

/// Switches controlling which checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Parse every path and template expression.
    pub check_paths: bool,
    /// Require Task resources to be ARNs.
    pub check_arn: bool,
    /// Skip validation entirely.
    pub no_validate: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_paths: true,
            check_arn: true,
            no_validate: false,
        }
    }
}

/// Outcome of validating a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(ValidationError {
                errors: self.errors,
            })
        }
    }
}

/// A definition was rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state machine definition is invalid: {}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

/// Validate `definition` under `options`.
pub fn validate(definition: &StateMachineDefinition, options: ValidationOptions) -> ValidationReport {
    if options.no_validate {
        return ValidationReport {
            is_valid: true,
            errors: Vec::new(),
        };
    }

    let mut validator = Validator {
        options,
        errors: Vec::new(),
    };
    if definition.timeout_seconds == Some(0) {
        validator.errors.push("TimeoutSeconds must be greater than 0".into());
    }
    validator.graph("", &definition.graph);

    ValidationReport {
        is_valid: validator.errors.is_empty(),
        errors: validator.errors,
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

struct Validator {
    options: ValidationOptions,
    errors: Vec<String>,
}

impl Validator {
    fn graph(&mut self, scope: &str, graph: &StateGraph) {
        if graph.states.is_empty() {
            self.errors.push(format!("{scope}States must not be empty"));
            return;
        }
        if graph.state(&graph.start_at).is_none() {
            self.errors.push(format!(
                "{scope}StartAt '{}' does not name a defined state",
                graph.start_at
            ));
        }

        for (name, state) in &graph.states {
            let location = format!("{scope}state '{name}'");
            self.state(&location, scope, graph, state);
        }

        self.reachability(scope, graph);
    }

    fn state(&mut self, location: &str, scope: &str, graph: &StateGraph, state: &State) {
        let nested = !scope.is_empty();

        // Transitions
        if let Some((next, end)) = state.transition() {
            match (next, end) {
                (Some(_), true) => self.errors.push(format!("{location}: 'Next' and 'End' are mutually exclusive")),
                (None, false) => self.errors.push(format!("{location}: must have either 'Next' or 'End: true'")),
                _ => {}
            }
            if let Some(next) = next {
                self.target(location, graph, next, "Next", false);
            }
        }

        for catcher in state.catchers() {
            self.target(location, graph, &catcher.next, "Catch Next", nested);
        }
        self.retriers(location, state.retriers());
        self.catchers(location, state.catchers());

        match state {
            State::Task(s) => {
                if s.timeout_seconds.is_some() && s.timeout_seconds_path.is_some() {
                    self.errors.push(format!(
                        "{location}: 'TimeoutSeconds' and 'TimeoutSecondsPath' are mutually exclusive"
                    ));
                }
                if s.timeout_seconds == Some(0) {
                    self.errors.push(format!("{location}: 'TimeoutSeconds' must be greater than 0"));
                }
                if s.heartbeat_seconds.is_some() && s.heartbeat_seconds_path.is_some() {
                    self.errors.push(format!(
                        "{location}: 'HeartbeatSeconds' and 'HeartbeatSecondsPath' are mutually exclusive"
                    ));
                }
                if let (Some(heartbeat), Some(timeout)) = (s.heartbeat_seconds, s.timeout_seconds) {
                    if heartbeat >= timeout {
                        self.errors.push(format!(
                            "{location}: 'HeartbeatSeconds' must be smaller than 'TimeoutSeconds'"
                        ));
                    }
                }
                if self.options.check_arn && !is_arn(&s.resource) {
                    self.errors
                        .push(format!("{location}: Resource '{}' is not a valid ARN", s.resource));
                }
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                    self.result_path(location, "ResultPath", &s.result_path);
                    self.template(location, "Parameters", s.parameters.as_ref());
                    self.template(location, "ResultSelector", s.result_selector.as_ref());
                    for (field, path) in [
                        ("TimeoutSecondsPath", &s.timeout_seconds_path),
                        ("HeartbeatSecondsPath", &s.heartbeat_seconds_path),
                    ] {
                        if let Some(path) = path {
                            self.path(location, field, path);
                        }
                    }
                }
            }
            State::Wait(s) => {
                let delays = [
                    s.seconds.is_some(),
                    s.timestamp.is_some(),
                    s.seconds_path.is_some(),
                    s.timestamp_path.is_some(),
                ]
                .iter()
                .filter(|set| **set)
                .count();
                if delays != 1 {
                    self.errors.push(format!(
                        "{location}: exactly one of 'Seconds', 'Timestamp', 'SecondsPath' or 'TimestampPath' is required"
                    ));
                }
                if let Some(ts) = &s.timestamp {
                    if crate::choice::parse_timestamp(&Value::String(ts.clone())).is_none() {
                        self.errors
                            .push(format!("{location}: Timestamp '{ts}' is not an RFC 3339 timestamp"));
                    }
                }
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                    for (field, path) in [("SecondsPath", &s.seconds_path), ("TimestampPath", &s.timestamp_path)] {
                        if let Some(path) = path {
                            self.path(location, field, path);
                        }
                    }
                }
            }
            State::Choice(s) => {
                if s.choices.is_empty() {
                    self.errors.push(format!("{location}: 'Choices' must not be empty"));
                }
                for (index, rule) in s.choices.iter().enumerate() {
                    match &rule.next {
                        Some(next) => self.target(location, graph, next, "Choice Next", false),
                        None => self
                            .errors
                            .push(format!("{location}: choice rule {index} is missing 'Next'")),
                    }
                    if self.options.check_paths {
                        self.condition(location, &rule.condition);
                    }
                }
                if let Some(default) = &s.default {
                    self.target(location, graph, default, "Default", false);
                }
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                }
            }
            State::Pass(s) => {
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                    self.result_path(location, "ResultPath", &s.result_path);
                    self.template(location, "Parameters", s.parameters.as_ref());
                }
            }
            State::Succeed(s) => {
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                }
            }
            State::Fail(s) => {
                if s.error.is_some() && s.error_path.is_some() {
                    self.errors
                        .push(format!("{location}: 'Error' and 'ErrorPath' are mutually exclusive"));
                }
                if s.cause.is_some() && s.cause_path.is_some() {
                    self.errors
                        .push(format!("{location}: 'Cause' and 'CausePath' are mutually exclusive"));
                }
                if self.options.check_paths {
                    for (field, path) in [("ErrorPath", &s.error_path), ("CausePath", &s.cause_path)] {
                        if let Some(path) = path {
                            self.path(location, field, path);
                        }
                    }
                }
            }
            State::Parallel(s) => {
                if s.branches.is_empty() {
                    self.errors.push(format!("{location}: 'Branches' must not be empty"));
                }
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                    self.result_path(location, "ResultPath", &s.result_path);
                    self.template(location, "Parameters", s.parameters.as_ref());
                    self.template(location, "ResultSelector", s.result_selector.as_ref());
                }
                for (index, branch) in s.branches.iter().enumerate() {
                    self.graph(&format!("{location} branch {index} > "), branch);
                }
            }
            State::Map(s) => {
                if self.options.check_paths {
                    self.io_paths(location, &s.input_path, &s.output_path);
                    self.result_path(location, "ResultPath", &s.result_path);
                    self.template(location, "ItemSelector", s.item_selector.as_ref());
                    self.template(location, "ResultSelector", s.result_selector.as_ref());
                    if let Some(items_path) = &s.items_path {
                        self.path(location, "ItemsPath", items_path);
                    }
                }
                self.graph(&format!("{location} item processor > "), &s.item_processor);
            }
        }
    }

    fn target(&mut self, location: &str, graph: &StateGraph, next: &str, field: &str, nested: bool) {
        if graph.state(next).is_none() {
            let hint = if nested {
                " (transitions cannot leave a Parallel branch or Map item processor)"
            } else {
                ""
            };
            self.errors
                .push(format!("{location}: {field} '{next}' does not name a state in the same graph{hint}"));
        }
    }

    fn retriers(&mut self, location: &str, retriers: &[Retrier]) {
        let lists: Vec<&[String]> = retriers.iter().map(|r| r.error_equals.as_slice()).collect();
        self.error_equals(location, "Retry", &lists);

        for (index, retrier) in retriers.iter().enumerate() {
            if retrier.interval_seconds == 0 {
                self.errors
                    .push(format!("{location}: Retry[{index}] 'IntervalSeconds' must be at least 1"));
            }
            if !(retrier.backoff_rate >= 1.0) {
                self.errors
                    .push(format!("{location}: Retry[{index}] 'BackoffRate' must be at least 1.0"));
            }
            if retrier.max_delay_seconds == Some(0) {
                self.errors
                    .push(format!("{location}: Retry[{index}] 'MaxDelaySeconds' must be at least 1"));
            }
        }
    }

    fn catchers(&mut self, location: &str, catchers: &[Catcher]) {
        let lists: Vec<&[String]> = catchers.iter().map(|c| c.error_equals.as_slice()).collect();
        self.error_equals(location, "Catch", &lists);

        if self.options.check_paths {
            for (index, catcher) in catchers.iter().enumerate() {
                self.result_path(location, &format!("Catch[{index}] ResultPath"), &catcher.result_path);
            }
        }
    }

    /// `ErrorEquals` must be non-empty, and `States.ALL` must appear alone in
    /// the last rule.
    fn error_equals(&mut self, location: &str, field: &str, lists: &[&[String]]) {
        for (index, list) in lists.iter().enumerate() {
            if list.is_empty() {
                self.errors
                    .push(format!("{location}: {field}[{index}] 'ErrorEquals' must not be empty"));
            }
            if list.iter().any(|e| e == error_kind::ALL) && (list.len() > 1 || index + 1 != lists.len()) {
                self.errors.push(format!(
                    "{location}: {field}[{index}] '{}' must appear alone in the last rule",
                    error_kind::ALL
                ));
            }
        }
    }

    fn io_paths(&mut self, location: &str, input_path: &PathSetting, output_path: &PathSetting) {
        if let PathSetting::Path(p) = input_path {
            self.path(location, "InputPath", p);
        }
        if let PathSetting::Path(p) = output_path {
            self.path(location, "OutputPath", p);
        }
    }

    fn result_path(&mut self, location: &str, field: &str, setting: &PathSetting) {
        if let PathSetting::Path(p) = setting {
            if let Err(e) = dataflow::check_path(p, true) {
                self.errors.push(format!("{location}: {field}: {e}"));
            }
        }
    }

    fn path(&mut self, location: &str, field: &str, path: &str) {
        if let Err(e) = dataflow::check_path(path, false) {
            self.errors.push(format!("{location}: {field}: {e}"));
        }
    }

    fn template(&mut self, location: &str, field: &str, template: Option<&Value>) {
        let Some(template) = template else {
            return;
        };
        for (key, expr) in dataflow::template_expressions(template) {
            let Some(expr) = expr.as_str() else {
                self.errors
                    .push(format!("{location}: {field} field '{key}' must hold a string expression"));
                continue;
            };
            if intrinsic::is_intrinsic(expr) {
                match IntrinsicCall::parse(expr) {
                    Ok(call) => {
                        for path in call.paths() {
                            self.path(location, &format!("{field} field '{key}'"), path);
                        }
                    }
                    Err(e) => self.errors.push(format!("{location}: {field} field '{key}': {e}")),
                }
            } else {
                self.path(location, &format!("{field} field '{key}'"), expr);
            }
        }
    }

    fn condition(&mut self, location: &str, condition: &Condition) {
        match condition {
            Condition::And(rules) | Condition::Or(rules) => {
                for rule in rules {
                    self.condition(location, rule);
                }
            }
            Condition::Not(rule) => self.condition(location, rule),
            Condition::Compare(cmp) => {
                self.path(location, "Variable", &cmp.variable);
                if let Operand::Path(p) = &cmp.operand {
                    self.path(location, &format!("{}Path", cmp.operator.name()), p);
                }
            }
        }
    }

    fn reachability(&mut self, scope: &str, graph: &StateGraph) {
        let mut g = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = graph
            .states
            .keys()
            .map(|name| (name.as_str(), g.add_node(name.as_str())))
            .collect();

        for (name, state) in &graph.states {
            let from = nodes[name.as_str()];
            for target in successors(state) {
                if let Some(&to) = nodes.get(target) {
                    g.add_edge(from, to, ());
                }
            }
        }

        let Some(&start) = nodes.get(graph.start_at.as_str()) else {
            return;
        };
        let mut reached = vec![false; g.node_count()];
        let mut dfs = Dfs::new(&g, start);
        while let Some(node) = dfs.next(&g) {
            reached[node.index()] = true;
        }

        for name in graph.states.keys() {
            if !reached[nodes[name.as_str()].index()] {
                self.errors
                    .push(format!("{scope}state '{name}' is not reachable from StartAt"));
            }
        }
    }
}

/// Every state name a state can transition to.
fn successors(state: &State) -> Vec<&str> {
    let mut out = Vec::new();
    if let Some((Some(next), _)) = state.transition() {
        out.push(next);
    }
    if let State::Choice(s) = state {
        out.extend(s.choices.iter().filter_map(|r| r.next.as_deref()));
        out.extend(s.default.as_deref());
    }
    out.extend(state.catchers().iter().map(|c| c.next.as_str()));
    out
}

fn is_arn(resource: &str) -> bool {
    resource.starts_with("arn:") && resource.split(':').count() >= 6
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ARN: &str = "arn:aws:lambda:us-east-1:123456789012:function:work";

    fn check(def: Value) -> ValidationReport {
        let def: StateMachineDefinition = serde_json::from_value(def).unwrap();
        validate(&def, ValidationOptions::default())
    }

    fn has_error(report: &ValidationReport, needle: &str) -> bool {
        report.errors.iter().any(|e| e.contains(needle))
    }

    #[test]
    fn test_valid_definition() {
        let report = check(json!({
            "StartAt": "Work",
            "States": {
                "Work": {
                    "Type": "Task",
                    "Resource": ARN,
                    "Parameters": { "id.$": "$.id", "msg.$": "States.Format('x{}', $.n)" },
                    "Retry": [{ "ErrorEquals": ["Custom"] }, { "ErrorEquals": ["States.ALL"] }],
                    "Catch": [{ "ErrorEquals": ["States.ALL"], "ResultPath": "$.err", "Next": "Failed" }],
                    "Next": "Check"
                },
                "Check": {
                    "Type": "Choice",
                    "Choices": [{ "Variable": "$.ok", "BooleanEquals": true, "Next": "Done" }],
                    "Default": "Failed"
                },
                "Done": { "Type": "Succeed" },
                "Failed": { "Type": "Fail", "Error": "Oops" }
            }
        }));
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_missing_start_and_dangling_next() {
        let report = check(json!({
            "StartAt": "Nope",
            "States": { "A": { "Type": "Pass", "Next": "Ghost" } }
        }));
        assert!(!report.is_valid);
        assert!(has_error(&report, "StartAt 'Nope'"));
        assert!(has_error(&report, "Next 'Ghost'"));
    }

    #[test]
    fn test_next_and_end_rules() {
        let report = check(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Pass", "Next": "B", "End": true },
                "B": { "Type": "Pass" }
            }
        }));
        assert!(has_error(&report, "mutually exclusive"));
        assert!(has_error(&report, "either 'Next' or 'End: true'"));
    }

    #[test]
    fn test_unreachable_state() {
        let report = check(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Succeed" },
                "Orphan": { "Type": "Succeed" }
            }
        }));
        assert!(has_error(&report, "state 'Orphan' is not reachable"));
    }

    #[test]
    fn test_choice_rules_need_next() {
        let report = check(json!({
            "StartAt": "C",
            "States": {
                "C": { "Type": "Choice", "Choices": [{ "Variable": "$.a", "IsPresent": true }] }
            }
        }));
        assert!(has_error(&report, "choice rule 0 is missing 'Next'"));
    }

    #[test]
    fn test_wait_requires_exactly_one_delay() {
        let report = check(json!({
            "StartAt": "W",
            "States": { "W": { "Type": "Wait", "Seconds": 1, "SecondsPath": "$.s", "End": true } }
        }));
        assert!(has_error(&report, "exactly one of 'Seconds'"));
    }

    #[test]
    fn test_fail_error_and_error_path_conflict() {
        let report = check(json!({
            "StartAt": "F",
            "States": { "F": { "Type": "Fail", "Error": "E", "ErrorPath": "$.e" } }
        }));
        assert!(has_error(&report, "'Error' and 'ErrorPath'"));
    }

    #[test]
    fn test_states_all_must_be_alone_and_last() {
        let report = check(json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": ARN,
                    "Retry": [
                        { "ErrorEquals": ["States.ALL"] },
                        { "ErrorEquals": ["Custom"] }
                    ],
                    "Catch": [{ "ErrorEquals": ["States.ALL", "Custom"], "Next": "T" }],
                    "End": true
                }
            }
        }));
        assert!(has_error(&report, "Retry[0] 'States.ALL'"));
        assert!(has_error(&report, "Catch[0] 'States.ALL'"));
    }

    #[test]
    fn test_retrier_ranges() {
        let report = check(json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": ARN,
                    "Retry": [{ "ErrorEquals": ["X"], "IntervalSeconds": 0, "BackoffRate": 0.5 }],
                    "End": true
                }
            }
        }));
        assert!(has_error(&report, "'IntervalSeconds' must be at least 1"));
        assert!(has_error(&report, "'BackoffRate' must be at least 1.0"));
    }

    #[test]
    fn test_arn_check_can_be_disabled() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "T",
            "States": { "T": { "Type": "Task", "Resource": "local-handler", "End": true } }
        }))
        .unwrap();
        let strict = validate(&def, ValidationOptions::default());
        assert!(has_error(&strict, "is not a valid ARN"));

        let relaxed = validate(
            &def,
            ValidationOptions {
                check_arn: false,
                ..Default::default()
            },
        );
        assert!(relaxed.is_valid);
    }

    #[test]
    fn test_path_checks() {
        let def = json!({
            "StartAt": "P",
            "States": {
                "P": {
                    "Type": "Pass",
                    "InputPath": "no-dollar",
                    "ResultPath": "$.items[*]",
                    "Parameters": { "bad.$": "States.Format('unterminated" },
                    "End": true
                }
            }
        });
        let report = check(def.clone());
        assert!(has_error(&report, "InputPath"));
        assert!(has_error(&report, "ResultPath"));
        assert!(has_error(&report, "Parameters field 'bad.$'"));

        let parsed: StateMachineDefinition = serde_json::from_value(def).unwrap();
        let relaxed = validate(
            &parsed,
            ValidationOptions {
                check_paths: false,
                ..Default::default()
            },
        );
        assert!(relaxed.is_valid);
    }

    #[test]
    fn test_catch_cannot_leave_map_iterator() {
        let report = check(json!({
            "StartAt": "M",
            "States": {
                "M": {
                    "Type": "Map",
                    "ItemProcessor": {
                        "StartAt": "Inner",
                        "States": {
                            "Inner": {
                                "Type": "Task",
                                "Resource": ARN,
                                "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Outer" }],
                                "End": true
                            }
                        }
                    },
                    "Next": "Outer"
                },
                "Outer": { "Type": "Succeed" }
            }
        }));
        assert!(!report.is_valid);
        assert!(has_error(&report, "cannot leave a Parallel branch or Map item processor"));
    }

    #[test]
    fn test_no_validate_skips_everything() {
        let def: StateMachineDefinition = serde_json::from_value(json!({
            "StartAt": "Missing",
            "States": { "A": { "Type": "Pass" } }
        }))
        .unwrap();
        let report = validate(
            &def,
            ValidationOptions {
                no_validate: true,
                ..Default::default()
            },
        );
        assert!(report.is_valid);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError {
            errors: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "state machine definition is invalid: a; b");
    }
}
