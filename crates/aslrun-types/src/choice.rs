//! Choice rule types.
//!
//! A Choice rule is a JSON object whose shape depends on which operator key it
//! carries (`StringEquals`, `NumericLessThanPath`, `And`, ...). It is parsed
//! into the typed `Condition` tree up front, so evaluation never has to look
//! at raw keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while parsing a Choice rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChoiceRuleError {
    #[error("choice rule must be a JSON object")]
    NotAnObject,

    #[error("choice rule is missing 'Variable'")]
    MissingVariable,

    #[error("choice rule has no comparison operator")]
    MissingOperator,

    #[error("choice rule has more than one comparison operator: {0}")]
    MultipleOperators(String),

    #[error("'{key}' expects {expected}")]
    InvalidOperand { key: String, expected: &'static str },
}

// ---------------------------------------------------------------------------
// ComparisonOperator
// ---------------------------------------------------------------------------

/// Comparison operators of the Choice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    StringEquals,
    StringLessThan,
    StringGreaterThan,
    StringLessThanEquals,
    StringGreaterThanEquals,
    StringMatches,
    NumericEquals,
    NumericLessThan,
    NumericGreaterThan,
    NumericLessThanEquals,
    NumericGreaterThanEquals,
    BooleanEquals,
    TimestampEquals,
    TimestampLessThan,
    TimestampGreaterThan,
    TimestampLessThanEquals,
    TimestampGreaterThanEquals,
    IsNull,
    IsPresent,
    IsNumeric,
    IsString,
    IsBoolean,
    IsTimestamp,
}

const OPERATORS: &[(&str, ComparisonOperator)] = &[
    ("StringEquals", ComparisonOperator::StringEquals),
    ("StringLessThan", ComparisonOperator::StringLessThan),
    ("StringGreaterThan", ComparisonOperator::StringGreaterThan),
    ("StringLessThanEquals", ComparisonOperator::StringLessThanEquals),
    ("StringGreaterThanEquals", ComparisonOperator::StringGreaterThanEquals),
    ("StringMatches", ComparisonOperator::StringMatches),
    ("NumericEquals", ComparisonOperator::NumericEquals),
    ("NumericLessThan", ComparisonOperator::NumericLessThan),
    ("NumericGreaterThan", ComparisonOperator::NumericGreaterThan),
    ("NumericLessThanEquals", ComparisonOperator::NumericLessThanEquals),
    ("NumericGreaterThanEquals", ComparisonOperator::NumericGreaterThanEquals),
    ("BooleanEquals", ComparisonOperator::BooleanEquals),
    ("TimestampEquals", ComparisonOperator::TimestampEquals),
    ("TimestampLessThan", ComparisonOperator::TimestampLessThan),
    ("TimestampGreaterThan", ComparisonOperator::TimestampGreaterThan),
    ("TimestampLessThanEquals", ComparisonOperator::TimestampLessThanEquals),
    ("TimestampGreaterThanEquals", ComparisonOperator::TimestampGreaterThanEquals),
    ("IsNull", ComparisonOperator::IsNull),
    ("IsPresent", ComparisonOperator::IsPresent),
    ("IsNumeric", ComparisonOperator::IsNumeric),
    ("IsString", ComparisonOperator::IsString),
    ("IsBoolean", ComparisonOperator::IsBoolean),
    ("IsTimestamp", ComparisonOperator::IsTimestamp),
];

impl ComparisonOperator {
    /// Parse an operator key, returning the operator and whether it is the
    /// `...Path` form. `StringMatches` and the type tests have no path form.
    pub fn from_key(key: &str) -> Option<(Self, bool)> {
        if let Some((_, op)) = OPERATORS.iter().find(|(name, _)| *name == key) {
            return Some((*op, false));
        }
        let base = key.strip_suffix("Path")?;
        OPERATORS
            .iter()
            .find(|(name, _)| *name == base)
            .filter(|(_, op)| op.accepts_path())
            .map(|(_, op)| (*op, true))
    }

    /// The operator's key in its literal form.
    pub fn name(&self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(name, _)| *name)
            .unwrap_or("Unknown")
    }

    /// Type tests (`IsNull`, `IsPresent`, ...) take a boolean and inspect the variable only.
    pub fn is_type_test(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::IsNull
                | ComparisonOperator::IsPresent
                | ComparisonOperator::IsNumeric
                | ComparisonOperator::IsString
                | ComparisonOperator::IsBoolean
                | ComparisonOperator::IsTimestamp
        )
    }

    fn accepts_path(&self) -> bool {
        !self.is_type_test() && *self != ComparisonOperator::StringMatches
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Literal value from the definition.
    Literal(Value),
    /// Path resolved against the state input (or `$$` context) at evaluation time.
    Path(String),
}

/// A single `Variable <op> operand` test.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub variable: String,
    pub operator: ComparisonOperator,
    pub operand: Operand,
}

/// Boolean condition tree of a Choice rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare(Comparison),
}

impl Condition {
    fn parse(map: &Map<String, Value>) -> Result<Self, ChoiceRuleError> {
        if let Some(rules) = map.get("And") {
            return Ok(Condition::And(Self::parse_list("And", rules)?));
        }
        if let Some(rules) = map.get("Or") {
            return Ok(Condition::Or(Self::parse_list("Or", rules)?));
        }
        if let Some(rule) = map.get("Not") {
            let inner = rule.as_object().ok_or(ChoiceRuleError::InvalidOperand {
                key: "Not".into(),
                expected: "an object",
            })?;
            return Ok(Condition::Not(Box::new(Self::parse(inner)?)));
        }

        let variable = map
            .get("Variable")
            .and_then(Value::as_str)
            .ok_or(ChoiceRuleError::MissingVariable)?
            .to_string();

        let mut found: Vec<(&String, ComparisonOperator, bool)> = map
            .keys()
            .filter_map(|k| ComparisonOperator::from_key(k).map(|(op, is_path)| (k, op, is_path)))
            .collect();

        if found.len() > 1 {
            let keys: Vec<&str> = found.iter().map(|(k, _, _)| k.as_str()).collect();
            return Err(ChoiceRuleError::MultipleOperators(keys.join(", ")));
        }
        let (key, operator, is_path) = found.pop().ok_or(ChoiceRuleError::MissingOperator)?;
        let raw = &map[key];

        let operand = if is_path {
            let path = raw.as_str().ok_or(ChoiceRuleError::InvalidOperand {
                key: key.clone(),
                expected: "a path string",
            })?;
            Operand::Path(path.to_string())
        } else {
            check_literal(key, operator, raw)?;
            Operand::Literal(raw.clone())
        };

        Ok(Condition::Compare(Comparison {
            variable,
            operator,
            operand,
        }))
    }

    fn parse_list(key: &str, value: &Value) -> Result<Vec<Condition>, ChoiceRuleError> {
        let items = value.as_array().ok_or(ChoiceRuleError::InvalidOperand {
            key: key.into(),
            expected: "an array of rules",
        })?;
        items
            .iter()
            .map(|item| {
                item.as_object()
                    .ok_or(ChoiceRuleError::NotAnObject)
                    .and_then(Self::parse)
            })
            .collect()
    }

    /// Serialize back to the state-language object form.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Condition::And(rules) => {
                map.insert(
                    "And".into(),
                    Value::Array(rules.iter().map(|r| Value::Object(r.to_map())).collect()),
                );
            }
            Condition::Or(rules) => {
                map.insert(
                    "Or".into(),
                    Value::Array(rules.iter().map(|r| Value::Object(r.to_map())).collect()),
                );
            }
            Condition::Not(rule) => {
                map.insert("Not".into(), Value::Object(rule.to_map()));
            }
            Condition::Compare(cmp) => {
                map.insert("Variable".into(), Value::String(cmp.variable.clone()));
                match &cmp.operand {
                    Operand::Literal(v) => {
                        map.insert(cmp.operator.name().into(), v.clone());
                    }
                    Operand::Path(p) => {
                        map.insert(format!("{}Path", cmp.operator.name()), Value::String(p.clone()));
                    }
                }
            }
        }
        map
    }
}

fn check_literal(
    key: &str,
    operator: ComparisonOperator,
    value: &Value,
) -> Result<(), ChoiceRuleError> {
    use ComparisonOperator::*;

    let (ok, expected) = match operator {
        StringEquals | StringLessThan | StringGreaterThan | StringLessThanEquals
        | StringGreaterThanEquals | StringMatches | TimestampEquals | TimestampLessThan
        | TimestampGreaterThan | TimestampLessThanEquals | TimestampGreaterThanEquals => {
            (value.is_string(), "a string")
        }
        NumericEquals | NumericLessThan | NumericGreaterThan | NumericLessThanEquals
        | NumericGreaterThanEquals => (value.is_number(), "a number"),
        BooleanEquals | IsNull | IsPresent | IsNumeric | IsString | IsBoolean | IsTimestamp => {
            (value.is_boolean(), "a boolean")
        }
    };

    if ok {
        Ok(())
    } else {
        Err(ChoiceRuleError::InvalidOperand {
            key: key.to_string(),
            expected,
        })
    }
}

// ---------------------------------------------------------------------------
// ChoiceRule
// ---------------------------------------------------------------------------

/// A top-level Choice rule: a condition and the state to go to when it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ChoiceRule {
    pub condition: Condition,
    /// Required on top-level rules; nested rules inside `And`/`Or`/`Not` omit it.
    pub next: Option<String>,
    pub comment: Option<String>,
}

impl TryFrom<Value> for ChoiceRule {
    type Error = ChoiceRuleError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let map = value.as_object().ok_or(ChoiceRuleError::NotAnObject)?;
        Ok(Self {
            condition: Condition::parse(map)?,
            next: map.get("Next").and_then(Value::as_str).map(str::to_string),
            comment: map.get("Comment").and_then(Value::as_str).map(str::to_string),
        })
    }
}

impl From<ChoiceRule> for Value {
    fn from(rule: ChoiceRule) -> Self {
        let mut map = rule.condition.to_map();
        if let Some(next) = rule.next {
            map.insert("Next".into(), Value::String(next));
        }
        if let Some(comment) = rule.comment {
            map.insert("Comment".into(), Value::String(comment));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<ChoiceRule, ChoiceRuleError> {
        ChoiceRule::try_from(value)
    }

    #[test]
    fn test_parse_simple_comparison() {
        let rule = parse(json!({ "Variable": "$.n", "NumericGreaterThan": 5, "Next": "Big" })).unwrap();
        assert_eq!(rule.next.as_deref(), Some("Big"));
        assert_eq!(
            rule.condition,
            Condition::Compare(Comparison {
                variable: "$.n".into(),
                operator: ComparisonOperator::NumericGreaterThan,
                operand: Operand::Literal(json!(5)),
            })
        );
    }

    #[test]
    fn test_parse_path_operand() {
        let rule = parse(json!({ "Variable": "$.a", "StringEqualsPath": "$.b", "Next": "X" })).unwrap();
        let Condition::Compare(cmp) = rule.condition else {
            panic!("expected comparison");
        };
        assert_eq!(cmp.operator, ComparisonOperator::StringEquals);
        assert_eq!(cmp.operand, Operand::Path("$.b".into()));
    }

    #[test]
    fn test_parse_nested_boolean_rules() {
        let rule = parse(json!({
            "And": [
                { "Variable": "$.a", "IsPresent": true },
                { "Not": { "Variable": "$.a", "BooleanEquals": false } }
            ],
            "Next": "Yes"
        }))
        .unwrap();
        let Condition::And(rules) = rule.condition else {
            panic!("expected And");
        };
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules[1], Condition::Not(_)));
    }

    #[test]
    fn test_rejects_missing_operator() {
        assert_eq!(
            parse(json!({ "Variable": "$.a", "Next": "X" })),
            Err(ChoiceRuleError::MissingOperator)
        );
    }

    #[test]
    fn test_rejects_multiple_operators() {
        let err = parse(json!({ "Variable": "$.a", "StringEquals": "x", "IsNull": true })).unwrap_err();
        assert!(matches!(err, ChoiceRuleError::MultipleOperators(_)));
    }

    #[test]
    fn test_rejects_wrong_literal_type() {
        let err = parse(json!({ "Variable": "$.a", "NumericEquals": "five" })).unwrap_err();
        assert!(matches!(err, ChoiceRuleError::InvalidOperand { .. }));
    }

    #[test]
    fn test_string_matches_has_no_path_form() {
        assert!(ComparisonOperator::from_key("StringMatchesPath").is_none());
        assert!(ComparisonOperator::from_key("IsNullPath").is_none());
        assert_eq!(
            ComparisonOperator::from_key("TimestampLessThanPath"),
            Some((ComparisonOperator::TimestampLessThan, true))
        );
    }

    #[test]
    fn test_serialize_back_to_object() {
        let original = json!({ "Variable": "$.a", "NumericLessThanPath": "$.b", "Next": "X" });
        let rule = parse(original.clone()).unwrap();
        assert_eq!(Value::from(rule), original);
    }
}
