//! Reference path evaluation.
//!
//! Paths address values inside JSON documents: `$` is the state input, `$$`
//! the context object. Segments are `.field`, `['field']`, `[index]`, and the
//! wildcards `.*` / `[*]`. Selecting through a wildcard collects every match
//! into an array. Filter expressions and recursive descent are not supported.
//!
//! Injection is copy-on-write: the target is never modified in place, so
//! branches sharing a value cannot observe each other's writes.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while parsing or evaluating a path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid path '{path}': {reason}")]
    Syntax { path: String, reason: String },

    #[error("path '{0}' could not be found in the input")]
    NotFound(String),

    #[error("cannot write to path '{path}': {reason}")]
    InvalidTarget { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// ReferencePath
// ---------------------------------------------------------------------------

/// Which document a path is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// `$` -- the value being processed.
    Data,
    /// `$$` -- the context object.
    Context,
}

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePath {
    raw: String,
    root: PathRoot,
    segments: Vec<Segment>,
}

impl ReferencePath {
    /// Parse a path string.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let syntax = |reason: &str| PathError::Syntax {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let (root, rest) = if let Some(rest) = path.strip_prefix("$$") {
            (PathRoot::Context, rest)
        } else if let Some(rest) = path.strip_prefix('$') {
            (PathRoot::Data, rest)
        } else {
            return Err(syntax("must start with '$'"));
        };

        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    match chars.get(i) {
                        None => return Err(syntax("trailing '.'")),
                        Some('.') => return Err(syntax("recursive descent is not supported")),
                        Some('*') => {
                            segments.push(Segment::Wildcard);
                            i += 1;
                        }
                        Some(_) => {
                            let start = i;
                            while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                                i += 1;
                            }
                            segments.push(Segment::Field(chars[start..i].iter().collect()));
                        }
                    }
                }
                '[' => {
                    i += 1;
                    match chars.get(i) {
                        Some(&quote) if quote == '\'' || quote == '"' => {
                            i += 1;
                            let mut name = String::new();
                            loop {
                                match chars.get(i) {
                                    None => return Err(syntax("unterminated quoted field")),
                                    Some('\\') => {
                                        let escaped =
                                            chars.get(i + 1).ok_or_else(|| syntax("dangling escape"))?;
                                        name.push(*escaped);
                                        i += 2;
                                    }
                                    Some(&c) if c == quote => {
                                        i += 1;
                                        break;
                                    }
                                    Some(&c) => {
                                        name.push(c);
                                        i += 1;
                                    }
                                }
                            }
                            segments.push(Segment::Field(name));
                        }
                        Some('*') => {
                            segments.push(Segment::Wildcard);
                            i += 1;
                        }
                        Some(c) if c.is_ascii_digit() => {
                            let start = i;
                            while i < chars.len() && chars[i].is_ascii_digit() {
                                i += 1;
                            }
                            let digits: String = chars[start..i].iter().collect();
                            let index = digits
                                .parse::<usize>()
                                .map_err(|_| syntax("array index out of range"))?;
                            segments.push(Segment::Index(index));
                        }
                        Some('?') | Some('(') => {
                            return Err(syntax("filter expressions are not supported"));
                        }
                        _ => return Err(syntax("expected field name, index or '*' after '['")),
                    }
                    if chars.get(i) != Some(&']') {
                        return Err(syntax("expected ']'"));
                    }
                    i += 1;
                }
                c => return Err(syntax(&format!("unexpected character '{c}'"))),
            }
        }

        Ok(Self {
            raw: path.to_string(),
            root,
            segments,
        })
    }

    pub fn root(&self) -> PathRoot {
        self.root
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// A definite path addresses at most one value (no wildcards).
    pub fn is_definite(&self) -> bool {
        !self.segments.contains(&Segment::Wildcard)
    }

    /// Select the value this path addresses inside `value`.
    ///
    /// A definite path that does not resolve is `PathError::NotFound`. A
    /// wildcard path returns an array of every match (possibly empty).
    pub fn select(&self, value: &Value) -> Result<Value, PathError> {
        if self.is_definite() {
            let mut cursor = value;
            for segment in &self.segments {
                cursor = match (segment, cursor) {
                    (Segment::Field(name), Value::Object(map)) => map.get(name),
                    (Segment::Index(idx), Value::Array(items)) => items.get(*idx),
                    _ => None,
                }
                .ok_or_else(|| PathError::NotFound(self.raw.clone()))?;
            }
            return Ok(cursor.clone());
        }

        let mut matches = Vec::new();
        collect_matches(value, &self.segments, &mut matches);
        Ok(Value::Array(matches))
    }

    /// Return a copy of `target` with `value` placed at this path.
    ///
    /// Missing intermediate objects and arrays are created; an index past the
    /// end of an array pads it with nulls. `$` alone replaces the whole target.
    pub fn inject(&self, target: &Value, value: Value) -> Result<Value, PathError> {
        let invalid = |reason: String| PathError::InvalidTarget {
            path: self.raw.clone(),
            reason,
        };

        if self.root == PathRoot::Context {
            return Err(invalid("the context object is read-only".into()));
        }
        if !self.is_definite() {
            return Err(invalid("wildcards cannot be written to".into()));
        }

        let mut output = target.clone();
        let mut cursor = &mut output;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => {
                    if cursor.is_null() {
                        *cursor = Value::Object(Map::new());
                    }
                    let map = cursor
                        .as_object_mut()
                        .ok_or_else(|| invalid(format!("cannot set field '{name}' on a non-object")))?;
                    cursor = map.entry(name.clone()).or_insert(Value::Null);
                }
                Segment::Index(idx) => {
                    if cursor.is_null() {
                        *cursor = Value::Array(Vec::new());
                    }
                    let items = cursor
                        .as_array_mut()
                        .ok_or_else(|| invalid(format!("cannot set index {idx} on a non-array")))?;
                    if *idx >= items.len() {
                        items.resize(*idx + 1, Value::Null);
                    }
                    cursor = &mut items[*idx];
                }
                Segment::Wildcard => return Err(invalid("wildcards cannot be written to".into())),
            }
        }
        *cursor = value;
        Ok(output)
    }
}

fn collect_matches(value: &Value, segments: &[Segment], out: &mut Vec<Value>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match (segment, value) {
        (Segment::Field(name), Value::Object(map)) => {
            if let Some(child) = map.get(name) {
                collect_matches(child, rest, out);
            }
        }
        (Segment::Index(idx), Value::Array(items)) => {
            if let Some(child) = items.get(*idx) {
                collect_matches(child, rest, out);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for child in map.values() {
                collect_matches(child, rest, out);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for child in items {
                collect_matches(child, rest, out);
            }
        }
        _ => {}
    }
}

impl FromStr for ReferencePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ReferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Convenience functions
// ---------------------------------------------------------------------------

/// Parse `path` and select from `value`, ignoring which root it names.
pub fn select(value: &Value, path: &str) -> Result<Value, PathError> {
    ReferencePath::parse(path)?.select(value)
}

/// Parse `path` and inject `value` into a copy of `target`.
pub fn inject(target: &Value, path: &str, value: Value) -> Result<Value, PathError> {
    ReferencePath::parse(path)?.inject(target, value)
}

/// Select against `input` or `context` depending on the path's root.
pub fn resolve(path: &str, input: &Value, context: &Value) -> Result<Value, PathError> {
    let parsed = ReferencePath::parse(path)?;
    match parsed.root() {
        PathRoot::Data => parsed.select(input),
        PathRoot::Context => parsed.select(context),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
