//! Intrinsic functions usable inside `.$` template fields.
//!
//! An intrinsic is a call expression such as
//! `States.Format('Hello {}', $.name)`. Arguments are string literals
//! (single-quoted, `\` escapes), numbers, `true`/`false`/`null`, reference
//! paths (`$...` or `$$...`) and nested intrinsic calls.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

use crate::path::{self, PathError};

/// Upper bound on the number of elements `States.ArrayRange` may produce.
const MAX_RANGE_ITEMS: usize = 1000;

/// Errors produced while parsing or evaluating an intrinsic call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntrinsicError {
    #[error("invalid intrinsic expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("unknown intrinsic function '{0}'")]
    UnknownFunction(String),

    #[error("{function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Whether a template string is an intrinsic call rather than a path.
pub fn is_intrinsic(expr: &str) -> bool {
    expr.trim_start().starts_with("States.")
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Literal(Value),
    Path(String),
    Call(IntrinsicCall),
}

/// A parsed intrinsic call.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicCall {
    name: String,
    args: Vec<Arg>,
}

impl IntrinsicCall {
    /// Parse a complete call expression. Trailing input is rejected.
    pub fn parse(expr: &str) -> Result<Self, IntrinsicError> {
        let mut parser = Parser {
            expr,
            chars: expr.chars().collect(),
            pos: 0,
        };
        parser.skip_ws();
        let call = parser.call()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(call)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate against the effective input and the context object.
    pub fn evaluate(&self, input: &Value, context: &Value) -> Result<Value, IntrinsicError> {
        let args = self
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Literal(v) => Ok(v.clone()),
                Arg::Path(p) => Ok(path::resolve(p, input, context)?),
                Arg::Call(call) => call.evaluate(input, context),
            })
            .collect::<Result<Vec<_>, _>>()?;
        apply(&self.name, args)
    }

    /// Every reference path used by this call, including nested calls.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for arg in &self.args {
            match arg {
                Arg::Path(p) => out.push(p.as_str()),
                Arg::Call(call) => out.extend(call.paths()),
                Arg::Literal(_) => {}
            }
        }
        out
    }
}

/// Parse and evaluate `expr` in one step.
pub fn evaluate(expr: &str, input: &Value, context: &Value) -> Result<Value, IntrinsicError> {
    IntrinsicCall::parse(expr)?.evaluate(input, context)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    expr: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> IntrinsicError {
        IntrinsicError::Syntax {
            expr: self.expr.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    fn call(&mut self) -> Result<IntrinsicCall, IntrinsicError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if !name.starts_with("States.") {
            return Err(self.error("expected a 'States.' function name"));
        }

        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.error("expected '('"));
        }
        self.pos += 1;

        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') && args.is_empty() {
                self.pos += 1;
                break;
            }
            args.push(self.arg()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }

        Ok(IntrinsicCall { name, args })
    }

    fn arg(&mut self) -> Result<Arg, IntrinsicError> {
        match self.peek() {
            Some('\'') => self.string().map(|s| Arg::Literal(Value::String(s))),
            Some('$') => Ok(Arg::Path(self.path())),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number().map(Arg::Literal),
            _ if self.starts_with("States.") => self.call().map(Arg::Call),
            _ => {
                for (word, value) in [("true", Value::Bool(true)), ("false", Value::Bool(false)), ("null", Value::Null)] {
                    if self.starts_with(word) {
                        self.pos += word.len();
                        return Ok(Arg::Literal(value));
                    }
                }
                Err(self.error("expected an argument"))
            }
        }
    }

    fn string(&mut self) -> Result<String, IntrinsicError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some('\\') => {
                    let escaped = self
                        .chars
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.error("dangling escape"))?;
                    // Escaped braces stay escaped so Format can tell them from placeholders.
                    if escaped == '{' || escaped == '}' {
                        out.push('\\');
                    }
                    out.push(escaped);
                    self.pos += 2;
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn path(&mut self) -> String {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '[') => depth += 1,
                (None, ']') => depth = depth.saturating_sub(1),
                (None, ',' | ')') if depth == 0 => break,
                (None, c) if c.is_whitespace() && depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn number(&mut self) -> Result<Value, IntrinsicError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        serde_json::from_str::<serde_json::Number>(&text)
            .map(Value::Number)
            .map_err(|_| self.error("invalid number"))
    }
}

// ---------------------------------------------------------------------------
// Function table
// ---------------------------------------------------------------------------

fn invalid(function: &str, reason: impl Into<String>) -> IntrinsicError {
    IntrinsicError::InvalidArguments {
        function: function.to_string(),
        reason: reason.into(),
    }
}

fn expect_arity(function: &str, args: &[Value], min: usize, max: usize) -> Result<(), IntrinsicError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(invalid(
            function,
            format!("expected {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn as_str<'v>(function: &str, value: &'v Value, what: &str) -> Result<&'v str, IntrinsicError> {
    value
        .as_str()
        .ok_or_else(|| invalid(function, format!("{what} must be a string")))
}

fn as_int(function: &str, value: &Value, what: &str) -> Result<i64, IntrinsicError> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 => Ok(f as i64),
        _ => Err(invalid(function, format!("{what} must be an integer"))),
    }
}

fn as_array<'v>(function: &str, value: &'v Value, what: &str) -> Result<&'v Vec<Value>, IntrinsicError> {
    value
        .as_array()
        .ok_or_else(|| invalid(function, format!("{what} must be an array")))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn apply(name: &str, args: Vec<Value>) -> Result<Value, IntrinsicError> {
    match name {
        "States.Format" => {
            if args.is_empty() {
                return Err(invalid(name, "expected a template argument"));
            }
            let template = as_str(name, &args[0], "template")?;
            let mut values = args[1..].iter();
            let mut out = String::new();
            let mut chars = template.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    '\\' if matches!(chars.peek(), Some('{' | '}' | '\\')) => {
                        out.extend(chars.next());
                    }
                    '{' if chars.peek() == Some(&'}') => {
                        chars.next();
                        let value = values
                            .next()
                            .ok_or_else(|| invalid(name, "more placeholders than arguments"))?;
                        out.push_str(&render(value));
                    }
                    c => out.push(c),
                }
            }
            if values.next().is_some() {
                return Err(invalid(name, "more arguments than placeholders"));
            }
            Ok(Value::String(out))
        }

        "States.StringToJson" => {
            expect_arity(name, &args, 1, 1)?;
            let text = as_str(name, &args[0], "argument")?;
            serde_json::from_str(text).map_err(|e| invalid(name, e.to_string()))
        }

        "States.JsonToString" => {
            expect_arity(name, &args, 1, 1)?;
            Ok(Value::String(args[0].to_string()))
        }

        "States.Array" => Ok(Value::Array(args)),

        "States.ArrayPartition" => {
            expect_arity(name, &args, 2, 2)?;
            let items = as_array(name, &args[0], "first argument")?;
            let size = as_int(name, &args[1], "chunk size")?;
            if size <= 0 {
                return Err(invalid(name, "chunk size must be positive"));
            }
            Ok(Value::Array(
                items
                    .chunks(size as usize)
                    .map(|chunk| Value::Array(chunk.to_vec()))
                    .collect(),
            ))
        }

        "States.ArrayContains" => {
            expect_arity(name, &args, 2, 2)?;
            let items = as_array(name, &args[0], "first argument")?;
            Ok(Value::Bool(items.contains(&args[1])))
        }

        "States.ArrayRange" => {
            expect_arity(name, &args, 3, 3)?;
            let start = as_int(name, &args[0], "start")?;
            let end = as_int(name, &args[1], "end")?;
            let step = as_int(name, &args[2], "step")?;
            if step == 0 {
                return Err(invalid(name, "step must not be zero"));
            }
            let mut out = Vec::new();
            let mut current = start;
            while (step > 0 && current <= end) || (step < 0 && current >= end) {
                if out.len() == MAX_RANGE_ITEMS {
                    return Err(invalid(name, format!("range exceeds {MAX_RANGE_ITEMS} items")));
                }
                out.push(Value::from(current));
                current += step;
            }
            Ok(Value::Array(out))
        }

        "States.ArrayGetItem" => {
            expect_arity(name, &args, 2, 2)?;
            let items = as_array(name, &args[0], "first argument")?;
            let index = as_int(name, &args[1], "index")?;
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| invalid(name, format!("index {index} is out of bounds")))
        }

        "States.ArrayLength" => {
            expect_arity(name, &args, 1, 1)?;
            Ok(Value::from(as_array(name, &args[0], "argument")?.len()))
        }

        "States.ArrayUnique" => {
            expect_arity(name, &args, 1, 1)?;
            let mut unique: Vec<Value> = Vec::new();
            for item in as_array(name, &args[0], "argument")? {
                if !unique.contains(item) {
                    unique.push(item.clone());
                }
            }
            Ok(Value::Array(unique))
        }

        "States.Base64Encode" => {
            expect_arity(name, &args, 1, 1)?;
            let text = as_str(name, &args[0], "argument")?;
            Ok(Value::String(BASE64.encode(text.as_bytes())))
        }

        "States.Base64Decode" => {
            expect_arity(name, &args, 1, 1)?;
            let text = as_str(name, &args[0], "argument")?;
            let bytes = BASE64
                .decode(text.as_bytes())
                .map_err(|e| invalid(name, e.to_string()))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| invalid(name, "decoded data is not valid UTF-8"))
        }

        "States.Hash" => {
            expect_arity(name, &args, 2, 2)?;
            let data = render(&args[0]);
            let algorithm = as_str(name, &args[1], "algorithm")?;
            let digest = match algorithm {
                "SHA-256" => hex(&Sha256::digest(data.as_bytes())),
                "SHA-384" => hex(&Sha384::digest(data.as_bytes())),
                "SHA-512" => hex(&Sha512::digest(data.as_bytes())),
                other => return Err(invalid(name, format!("unsupported algorithm '{other}'"))),
            };
            Ok(Value::String(digest))
        }

        "States.JsonMerge" => {
            expect_arity(name, &args, 3, 3)?;
            if args[2] != Value::Bool(false) {
                return Err(invalid(name, "only shallow merges (false) are supported"));
            }
            let (Value::Object(left), Value::Object(right)) = (&args[0], &args[1]) else {
                return Err(invalid(name, "both arguments must be objects"));
            };
            let mut merged: Map<String, Value> = left.clone();
            merged.extend(right.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(Value::Object(merged))
        }

        "States.MathRandom" => {
            expect_arity(name, &args, 2, 3)?;
            let start = as_int(name, &args[0], "start")?;
            let end = as_int(name, &args[1], "end")?;
            if start >= end {
                return Err(invalid(name, "start must be less than end"));
            }
            let value = match args.get(2) {
                Some(seed) => {
                    let seed = as_int(name, seed, "seed")?;
                    StdRng::seed_from_u64(seed as u64).random_range(start..end)
                }
                None => rand::rng().random_range(start..end),
            };
            Ok(Value::from(value))
        }

        "States.MathAdd" => {
            expect_arity(name, &args, 2, 2)?;
            let a = as_int(name, &args[0], "first argument")?;
            let b = as_int(name, &args[1], "second argument")?;
            a.checked_add(b)
                .map(Value::from)
                .ok_or_else(|| invalid(name, "integer overflow"))
        }

        "States.StringSplit" => {
            expect_arity(name, &args, 2, 2)?;
            let text = as_str(name, &args[0], "first argument")?;
            let delimiters: Vec<char> = as_str(name, &args[1], "delimiter")?.chars().collect();
            Ok(Value::Array(
                text.split(delimiters.as_slice())
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }

        "States.UUID" => {
            expect_arity(name, &args, 0, 0)?;
            Ok(Value::String(uuid::Uuid::new_v4().to_string()))
        }

        other => Err(IntrinsicError::UnknownFunction(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str) -> Result<Value, IntrinsicError> {
        let input = json!({ "name": "Ada", "list": [1, 2, 2, 3], "obj": { "a": 1 } });
        let context = json!({ "Execution": { "Id": "exec-1" } });
        evaluate(expr, &input, &context)
    }

    #[test]
    fn test_is_intrinsic() {
        assert!(is_intrinsic("States.UUID()"));
        assert!(!is_intrinsic("$.name"));
    }

    #[test]
    fn test_format_with_paths_and_escapes() {
        assert_eq!(
            eval("States.Format('Hello {} from {}', $.name, $$.Execution.Id)").unwrap(),
            json!("Hello Ada from exec-1")
        );
        assert_eq!(eval(r"States.Format('\{literal\} {}', 5)").unwrap(), json!("{literal} 5"));
        assert_eq!(eval("States.Format('it\\'s {}', true)").unwrap(), json!("it's true"));
        assert!(eval("States.Format('{} {}', 1)").is_err());
    }

    #[test]
    fn test_json_conversions() {
        assert_eq!(eval("States.StringToJson('{\"a\":1}')").unwrap(), json!({ "a": 1 }));
        assert_eq!(eval("States.JsonToString($.obj)").unwrap(), json!("{\"a\":1}"));
    }

    #[test]
    fn test_array_functions() {
        assert_eq!(eval("States.Array(1, 'two', null)").unwrap(), json!([1, "two", null]));
        assert_eq!(eval("States.ArrayPartition($.list, 3)").unwrap(), json!([[1, 2, 2], [3]]));
        assert_eq!(eval("States.ArrayContains($.list, 3)").unwrap(), json!(true));
        assert_eq!(eval("States.ArrayRange(1, 9, 3)").unwrap(), json!([1, 4, 7]));
        assert_eq!(eval("States.ArrayGetItem($.list, 3)").unwrap(), json!(3));
        assert_eq!(eval("States.ArrayLength($.list)").unwrap(), json!(4));
        assert_eq!(eval("States.ArrayUnique($.list)").unwrap(), json!([1, 2, 3]));
        assert!(eval("States.ArrayGetItem($.list, 10)").is_err());
        assert!(eval("States.ArrayRange(0, 5000, 1)").is_err());
    }

    #[test]
    fn test_nested_calls() {
        assert_eq!(
            eval("States.ArrayLength(States.Array($.name, States.UUID()))").unwrap(),
            json!(2)
        );
    }

    #[test]
    fn test_base64_and_hash() {
        assert_eq!(eval("States.Base64Encode('hello')").unwrap(), json!("aGVsbG8="));
        assert_eq!(eval("States.Base64Decode('aGVsbG8=')").unwrap(), json!("hello"));
        assert_eq!(
            eval("States.Hash('abc', 'SHA-256')").unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(eval("States.Hash('abc', 'MD5')").is_err());
    }

    #[test]
    fn test_json_merge_is_shallow() {
        let input = json!({ "a": { "x": 1, "y": 2 }, "b": { "y": 3 } });
        let merged = evaluate("States.JsonMerge($.a, $.b, false)", &input, &json!({})).unwrap();
        assert_eq!(merged, json!({ "x": 1, "y": 3 }));
        assert!(evaluate("States.JsonMerge($.a, $.b, true)", &input, &json!({})).is_err());
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(eval("States.MathAdd(40, -2)").unwrap(), json!(38));
        let n = eval("States.MathRandom(1, 10)").unwrap().as_i64().unwrap();
        assert!((1..10).contains(&n));
        let seeded_a = eval("States.MathRandom(0, 1000, 42)").unwrap();
        let seeded_b = eval("States.MathRandom(0, 1000, 42)").unwrap();
        assert_eq!(seeded_a, seeded_b);
    }

    #[test]
    fn test_string_split() {
        assert_eq!(
            eval("States.StringSplit('a,b;;c', ',;')").unwrap(),
            json!(["a", "b", "c"])
        );
    }

    #[test]
    fn test_uuid_is_v4() {
        let id = eval("States.UUID()").unwrap();
        let parsed = uuid::Uuid::parse_str(id.as_str().unwrap()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            eval("States.Nope(1)"),
            Err(IntrinsicError::UnknownFunction("States.Nope".into()))
        );
        assert!(matches!(eval("States.Array(1"), Err(IntrinsicError::Syntax { .. })));
        assert!(matches!(eval("States.Array(1) extra"), Err(IntrinsicError::Syntax { .. })));
        assert!(matches!(eval("States.ArrayLength($.missing)"), Err(IntrinsicError::Path(_))));
    }

    #[test]
    fn test_collects_paths() {
        let call = IntrinsicCall::parse("States.Format('{}{}', $.a, States.Array($$.b['c,d']))").unwrap();
        assert_eq!(call.name(), "States.Format");
        assert_eq!(call.paths(), vec!["$.a", "$$.b['c,d']"]);
    }
}
