//! Choice rule evaluation.

use std::cmp::Ordering;

use aslrun_types::choice::{ChoiceRule, Comparison, ComparisonOperator, Condition, Operand};
use aslrun_types::error::{ErrorRecord, error_kind};
use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::path::{self, PathError};

/// Pick the next state for a Choice state.
///
/// Rules are tried in order and the first match wins; otherwise `default`
/// is taken; otherwise the state fails with `States.NoChoiceMatched`.
pub fn select_next<'r>(
    rules: &'r [ChoiceRule],
    default: Option<&'r str>,
    input: &Value,
    context: &Value,
) -> Result<&'r str, ErrorRecord> {
    for rule in rules {
        if evaluate(&rule.condition, input, context)? {
            return rule
                .next
                .as_deref()
                .ok_or_else(|| ErrorRecord::runtime("matched choice rule has no 'Next'"));
        }
    }
    default.ok_or_else(|| {
        ErrorRecord::new(
            error_kind::NO_CHOICE_MATCHED,
            "no choice rule matched and no Default was specified",
        )
    })
}

/// Evaluate a condition tree against the effective input.
///
/// A comparison whose `Variable` does not resolve fails with
/// `States.Runtime`, except for `IsPresent`. Comparing values of the wrong
/// type is simply false.
pub fn evaluate(condition: &Condition, input: &Value, context: &Value) -> Result<bool, ErrorRecord> {
    match condition {
        Condition::And(rules) => {
            for rule in rules {
                if !evaluate(rule, input, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or(rules) => {
            for rule in rules {
                if evaluate(rule, input, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not(rule) => Ok(!evaluate(rule, input, context)?),
        Condition::Compare(cmp) => compare(cmp, input, context),
    }
}

fn compare(cmp: &Comparison, input: &Value, context: &Value) -> Result<bool, ErrorRecord> {
    let variable = match path::resolve(&cmp.variable, input, context) {
        Ok(v) => Some(v),
        Err(PathError::NotFound(_)) => None,
        Err(e) => return Err(ErrorRecord::runtime(format!("invalid Variable: {e}"))),
    };

    let operand = match &cmp.operand {
        Operand::Literal(v) => v.clone(),
        Operand::Path(p) => path::resolve(p, input, context).map_err(|e| {
            ErrorRecord::runtime(format!("{}Path failed: {e}", cmp.operator.name()))
        })?,
    };

    use ComparisonOperator::*;

    let Some(variable) = variable else {
        if cmp.operator == IsPresent {
            return Ok(operand == Value::Bool(false));
        }
        return Err(ErrorRecord::runtime(format!(
            "Invalid path '{}': the choice state's condition path references an invalid value",
            cmp.variable
        )));
    };

    let result = match cmp.operator {
        StringEquals => cmp_strings(&variable, &operand) == Some(Ordering::Equal),
        StringLessThan => cmp_strings(&variable, &operand) == Some(Ordering::Less),
        StringGreaterThan => cmp_strings(&variable, &operand) == Some(Ordering::Greater),
        StringLessThanEquals => matches!(cmp_strings(&variable, &operand), Some(Ordering::Less | Ordering::Equal)),
        StringGreaterThanEquals => {
            matches!(cmp_strings(&variable, &operand), Some(Ordering::Greater | Ordering::Equal))
        }
        StringMatches => match (variable.as_str(), operand.as_str()) {
            (Some(text), Some(pattern)) => glob_matches(pattern, text),
            _ => false,
        },
        NumericEquals => cmp_numbers(&variable, &operand) == Some(Ordering::Equal),
        NumericLessThan => cmp_numbers(&variable, &operand) == Some(Ordering::Less),
        NumericGreaterThan => cmp_numbers(&variable, &operand) == Some(Ordering::Greater),
        NumericLessThanEquals => matches!(cmp_numbers(&variable, &operand), Some(Ordering::Less | Ordering::Equal)),
        NumericGreaterThanEquals => {
            matches!(cmp_numbers(&variable, &operand), Some(Ordering::Greater | Ordering::Equal))
        }
        BooleanEquals => match (variable.as_bool(), operand.as_bool()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        TimestampEquals => cmp_timestamps(&variable, &operand) == Some(Ordering::Equal),
        TimestampLessThan => cmp_timestamps(&variable, &operand) == Some(Ordering::Less),
        TimestampGreaterThan => cmp_timestamps(&variable, &operand) == Some(Ordering::Greater),
        TimestampLessThanEquals => {
            matches!(cmp_timestamps(&variable, &operand), Some(Ordering::Less | Ordering::Equal))
        }
        TimestampGreaterThanEquals => {
            matches!(cmp_timestamps(&variable, &operand), Some(Ordering::Greater | Ordering::Equal))
        }
        IsNull => variable.is_null() == is_true(&operand),
        IsPresent => is_true(&operand),
        IsNumeric => variable.is_number() == is_true(&operand),
        IsString => variable.is_string() == is_true(&operand),
        IsBoolean => variable.is_boolean() == is_true(&operand),
        IsTimestamp => parse_timestamp(&variable).is_some() == is_true(&operand),
    };
    Ok(result)
}

fn is_true(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

fn cmp_strings(a: &Value, b: &Value) -> Option<Ordering> {
    Some(a.as_str()?.cmp(b.as_str()?))
}

fn cmp_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn cmp_timestamps(a: &Value, b: &Value) -> Option<Ordering> {
    Some(parse_timestamp(a)?.cmp(&parse_timestamp(b)?))
}

/// Parse an RFC 3339 timestamp string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.as_str()?).ok()
}

/// `StringMatches` semantics: `*` matches any run of characters, `\*` and
/// `\\` are literal.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    #[derive(PartialEq)]
    enum Token {
        Char(char),
        Star,
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Token::Char(escaped)),
                None => tokens.push(Token::Char('\\')),
            },
            '*' => tokens.push(Token::Star),
            c => tokens.push(Token::Char(c)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match tokens.get(p) {
            Some(Token::Char(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            Some(Token::Star) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|token| *token == Token::Star)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
