//! Input/output processing applied around every state.
//!
//! The stages run in a fixed order: `InputPath`, `Parameters` (or
//! `ItemSelector`), the state body, `ResultSelector`, `ResultPath`,
//! `OutputPath`. Each stage reports failure with its own error kind so
//! retriers and catchers can tell them apart.

use aslrun_types::definition::PathSetting;
use aslrun_types::error::ErrorRecord;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::intrinsic::{self, IntrinsicError};
use crate::path::{self, PathError, PathRoot, ReferencePath};

/// Suffix marking a template field whose value is a path or intrinsic call.
pub const DYNAMIC_SUFFIX: &str = ".$";

/// Failure while rendering a payload template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("field '{field}': {source}")]
    Path { field: String, source: PathError },

    #[error("field '{field}': {source}")]
    Intrinsic {
        field: String,
        source: IntrinsicError,
    },

    #[error("field '{0}' must hold a path or intrinsic string")]
    NotAString(String),
}

impl TemplateError {
    /// Convert into the record surfaced by a template stage.
    fn into_record(self) -> ErrorRecord {
        match self {
            TemplateError::Intrinsic { .. } => ErrorRecord::intrinsic_failure(self.to_string()),
            _ => ErrorRecord::parameter_path_failure(self.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Render a `Parameters` / `ResultSelector` / `ItemSelector` template.
///
/// Keys ending in `.$` are resolved against `input` (`$...`), the context
/// object (`$$...`), or evaluated as an intrinsic call; the suffix is dropped
/// from the output key. Everything else is copied, recursing into nested
/// objects and arrays.
pub fn render_template(template: &Value, input: &Value, context: &Value) -> Result<Value, TemplateError> {
    match template {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                if let Some(name) = key.strip_suffix(DYNAMIC_SUFFIX) {
                    let expr = value
                        .as_str()
                        .ok_or_else(|| TemplateError::NotAString(key.clone()))?;
                    let resolved = if intrinsic::is_intrinsic(expr) {
                        intrinsic::evaluate(expr, input, context).map_err(|source| {
                            TemplateError::Intrinsic {
                                field: key.clone(),
                                source,
                            }
                        })?
                    } else {
                        path::resolve(expr, input, context).map_err(|source| TemplateError::Path {
                            field: key.clone(),
                            source,
                        })?
                    };
                    out.insert(name.to_string(), resolved);
                } else {
                    out.insert(key.clone(), render_template(value, input, context)?);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, input, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Every `(field, expression)` pair of a template, depth first.
pub fn template_expressions(template: &Value) -> Vec<(&str, &Value)> {
    let mut out = Vec::new();
    collect_expressions(template, &mut out);
    out
}

fn collect_expressions<'t>(template: &'t Value, out: &mut Vec<(&'t str, &'t Value)>) {
    match template {
        Value::Object(fields) => {
            for (key, value) in fields {
                if key.ends_with(DYNAMIC_SUFFIX) {
                    out.push((key.as_str(), value));
                } else {
                    collect_expressions(value, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_expressions(item, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn select_stage(stage: &str, setting: &PathSetting, data: &Value, context: &Value) -> Result<Value, ErrorRecord> {
    match setting.effective() {
        None => Ok(Value::Object(Map::new())),
        Some("$") => Ok(data.clone()),
        Some(p) => path::resolve(p, data, context)
            .map_err(|e| ErrorRecord::runtime(format!("{stage} failed: {e}"))),
    }
}

/// Stage 1: choose the effective input. `null` yields `{}`.
pub fn apply_input_path(setting: &PathSetting, data: &Value, context: &Value) -> Result<Value, ErrorRecord> {
    select_stage("InputPath", setting, data, context)
}

/// Stage 2: render `Parameters` against the effective input, if present.
pub fn apply_parameters(template: Option<&Value>, input: Value, context: &Value) -> Result<Value, ErrorRecord> {
    match template {
        Some(t) => render_template(t, &input, context).map_err(TemplateError::into_record),
        None => Ok(input),
    }
}

/// Stage 4: render `ResultSelector` against the raw result, if present.
pub fn apply_result_selector(
    template: Option<&Value>,
    result: Value,
    context: &Value,
) -> Result<Value, ErrorRecord> {
    apply_parameters(template, result, context)
}

/// Build one Map iteration's input: the rendered `ItemSelector` when present,
/// otherwise the item itself. `context` carries `$$.Map.Item`.
pub fn apply_item_selector(
    template: Option<&Value>,
    item: Value,
    input: &Value,
    context: &Value,
) -> Result<Value, ErrorRecord> {
    match template {
        Some(t) => render_template(t, input, context).map_err(TemplateError::into_record),
        None => Ok(item),
    }
}

/// Stage 5: combine the result with the state's raw input.
///
/// Default/`$` replaces the input with the result; `null` discards the result
/// and keeps the input; any other path injects the result into a copy of the
/// input.
pub fn apply_result_path(setting: &PathSetting, raw_input: &Value, result: Value) -> Result<Value, ErrorRecord> {
    match setting.effective() {
        None => Ok(raw_input.clone()),
        Some("$") => Ok(result),
        Some(p) => path::inject(raw_input, p, result)
            .map_err(|e| ErrorRecord::result_path_match_failure(format!("ResultPath failed: {e}"))),
    }
}

/// Stage 6: choose what is passed on. `null` yields `{}`.
pub fn apply_output_path(setting: &PathSetting, data: &Value, context: &Value) -> Result<Value, ErrorRecord> {
    select_stage("OutputPath", setting, data, context)
}

/// Resolve a Map state's `ItemsPath` (default `$`) to its item array.
pub fn select_items(items_path: Option<&str>, input: &Value, context: &Value) -> Result<Vec<Value>, ErrorRecord> {
    let items_path = items_path.unwrap_or("$");
    let items = path::resolve(items_path, input, context)
        .map_err(|e| ErrorRecord::parameter_path_failure(format!("ItemsPath failed: {e}")))?;
    match items {
        Value::Array(items) => Ok(items),
        other => Err(ErrorRecord::parameter_path_failure(format!(
            "ItemsPath '{items_path}' must select an array, got {}",
            json_type(&other)
        ))),
    }
}

/// Resolve a path that must exist (`SecondsPath`, `ErrorPath`, ...), mapping
/// a miss to `States.Runtime`.
pub fn resolve_required(field: &str, path: &str, input: &Value, context: &Value) -> Result<Value, ErrorRecord> {
    path::resolve(path, input, context).map_err(|e| ErrorRecord::runtime(format!("{field} failed: {e}")))
}

/// Whether a path string is well formed and, when `writable`, usable as an
/// injection target.
pub fn check_path(path: &str, writable: bool) -> Result<(), PathError> {
    let parsed = ReferencePath::parse(path)?;
    if writable && (!parsed.is_definite() || parsed.root() == PathRoot::Context) {
        return Err(PathError::InvalidTarget {
            path: path.to_string(),
            reason: "must be a definite data path".into(),
        });
    }
    Ok(())
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aslrun_types::error::error_kind;
    use serde_json::json;

    fn ctx() -> Value {
        json!({ "Execution": { "Id": "exec-1" }, "State": { "Name": "S" } })
    }

    #[test]
    fn test_input_path_variants() {
        let data = json!({ "a": { "b": 1 } });
        assert_eq!(apply_input_path(&PathSetting::Default, &data, &ctx()).unwrap(), data);
        assert_eq!(apply_input_path(&PathSetting::Null, &data, &ctx()).unwrap(), json!({}));
        assert_eq!(
            apply_input_path(&PathSetting::Path("$.a".into()), &data, &ctx()).unwrap(),
            json!({ "b": 1 })
        );
        let err = apply_input_path(&PathSetting::Path("$.zz".into()), &data, &ctx()).unwrap_err();
        assert_eq!(err.error, error_kind::RUNTIME);
    }

    #[test]
    fn test_parameters_template() {
        let template = json!({
            "static": "x",
            "name.$": "$.user.name",
            "exec.$": "$$.Execution.Id",
            "greeting.$": "States.Format('hi {}', $.user.name)",
            "nested": { "first.$": "$.items[0]" },
            "list": [{ "v.$": "$.items[1]" }, 3]
        });
        let input = json!({ "user": { "name": "Ada" }, "items": [10, 20] });
        let out = apply_parameters(Some(&template), input, &ctx()).unwrap();
        assert_eq!(
            out,
            json!({
                "static": "x",
                "name": "Ada",
                "exec": "exec-1",
                "greeting": "hi Ada",
                "nested": { "first": 10 },
                "list": [{ "v": 20 }, 3]
            })
        );
    }

    #[test]
    fn test_parameters_absent_is_identity() {
        let input = json!({ "k": true });
        assert_eq!(apply_parameters(None, input.clone(), &ctx()).unwrap(), input);
    }

    #[test]
    fn test_template_failures_have_stage_kinds() {
        let missing = apply_parameters(Some(&json!({ "x.$": "$.missing" })), json!({}), &ctx()).unwrap_err();
        assert_eq!(missing.error, error_kind::PARAMETER_PATH_FAILURE);

        let intrinsic =
            apply_parameters(Some(&json!({ "x.$": "States.ArrayLength('no')" })), json!({}), &ctx()).unwrap_err();
        assert_eq!(intrinsic.error, error_kind::INTRINSIC_FAILURE);

        let not_string = apply_parameters(Some(&json!({ "x.$": 5 })), json!({}), &ctx()).unwrap_err();
        assert_eq!(not_string.error, error_kind::PARAMETER_PATH_FAILURE);
    }

    #[test]
    fn test_item_selector_uses_map_context() {
        let context = json!({ "Map": { "Item": { "Index": 1, "Value": "b" } } });
        let template = json!({ "value.$": "$$.Map.Item.Value", "tag.$": "$.tag" });
        let out = apply_item_selector(Some(&template), json!("b"), &json!({ "tag": "t" }), &context).unwrap();
        assert_eq!(out, json!({ "value": "b", "tag": "t" }));

        assert_eq!(
            apply_item_selector(None, json!("b"), &json!({}), &context).unwrap(),
            json!("b")
        );
    }

    #[test]
    fn test_item_selector_failures_have_stage_kinds() {
        let context = json!({ "Map": { "Item": { "Index": 0, "Value": "notarray" } } });
        let intrinsic = apply_item_selector(
            Some(&json!({ "n.$": "States.ArrayLength($$.Map.Item.Value)" })),
            json!("notarray"),
            &json!({}),
            &context,
        )
        .unwrap_err();
        assert_eq!(intrinsic.error, error_kind::INTRINSIC_FAILURE);

        let missing =
            apply_item_selector(Some(&json!({ "n.$": "$.missing" })), json!(1), &json!({}), &context).unwrap_err();
        assert_eq!(missing.error, error_kind::PARAMETER_PATH_FAILURE);
    }

    #[test]
    fn test_result_path_variants() {
        let raw = json!({ "a": 1 });
        assert_eq!(
            apply_result_path(&PathSetting::Default, &raw, json!("r")).unwrap(),
            json!("r")
        );
        assert_eq!(apply_result_path(&PathSetting::Null, &raw, json!("r")).unwrap(), raw);
        assert_eq!(
            apply_result_path(&PathSetting::Path("$.out.v".into()), &raw, json!("r")).unwrap(),
            json!({ "a": 1, "out": { "v": "r" } })
        );
        let err = apply_result_path(&PathSetting::Path("$.a.b".into()), &raw, json!("r")).unwrap_err();
        assert_eq!(err.error, error_kind::RESULT_PATH_MATCH_FAILURE);
    }

    #[test]
    fn test_output_path_null_is_empty_object() {
        assert_eq!(
            apply_output_path(&PathSetting::Null, &json!({ "a": 1 }), &ctx()).unwrap(),
            json!({})
        );
    }

    #[test]
    fn test_select_items() {
        let input = json!({ "items": [1, 2], "scalar": 3 });
        assert_eq!(select_items(Some("$.items"), &input, &ctx()).unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(select_items(None, &json!([4]), &ctx()).unwrap(), vec![json!(4)]);
        let err = select_items(Some("$.scalar"), &input, &ctx()).unwrap_err();
        assert_eq!(err.error, error_kind::PARAMETER_PATH_FAILURE);
        let err = select_items(Some("$.nope"), &input, &ctx()).unwrap_err();
        assert_eq!(err.error, error_kind::PARAMETER_PATH_FAILURE);
    }

    #[test]
    fn test_template_expressions_walks_nested() {
        let template = json!({ "a.$": "$.x", "b": [{ "c.$": "States.UUID()" }], "d": 1 });
        let exprs: Vec<&str> = template_expressions(&template).into_iter().map(|(k, _)| k).collect();
        assert_eq!(exprs, vec!["a.$", "c.$"]);
    }

    #[test]
    fn test_check_path_writable() {
        assert!(check_path("$.a", true).is_ok());
        assert!(check_path("$.a[*]", true).is_err());
        assert!(check_path("$$.Execution", true).is_err());
        assert!(check_path("$$.Execution", false).is_ok());
        assert!(check_path("a.b", false).is_err());
    }
}
