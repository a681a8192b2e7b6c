//! Structural matching of responses against expectation templates
//!
//! Templates are plain JSON values in which a few marker shapes carry special
//! meaning (see [`crate::template`]). They compile into an [`Expect`] tree:
//!
//! - scalars compare by value (numbers numerically)
//! - objects are matched by containment: every expected key must be present
//!   and match, keys only present in the actual value are ignored
//! - arrays are ordered and must have the same length
//! - `"$ignore"` matches anything, including a missing key
//! - `{"$regex": p}` matches when `p` is found anywhere in the actual text
//! - `{"$unordered": [..], "$exact": b}` compares as a multiset, `b = false`
//!   allowing extra actual items
//! - `{"$literal": v}` requires full deep equality with `v`
//! - `"$last_request_id"` / `"$last_module_session_id"` compare against the
//!   session state at the moment of matching

use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{RunnerError, RunnerResult};
use crate::template::marker;

/// A compiled expectation
#[derive(Debug, Clone)]
pub enum Expect {
    Ignore,
    Literal(Value),
    Regex(Regex),
    Object(Vec<(String, Expect)>),
    Array(Vec<Expect>),
    Unordered { items: Vec<Expect>, exact: bool },
    LastRequestId,
    LastModuleSessionId,
}

impl Expect {
    /// Compile a template value. Namespace placeholders (`$token`, `$param`)
    /// must already have been resolved.
    pub fn compile(template: &Value) -> RunnerResult<Self> {
        match template {
            Value::String(s) => Ok(match s.as_str() {
                marker::IGNORE => Expect::Ignore,
                marker::LAST_REQUEST_ID => Expect::LastRequestId,
                marker::LAST_MODULE_SESSION_ID => Expect::LastModuleSessionId,
                marker::GENERATE_REQUEST_ID => {
                    return Err(RunnerError::InvalidTemplate(format!(
                        "'{}' is only valid in outgoing messages",
                        marker::GENERATE_REQUEST_ID
                    )))
                }
                _ => Expect::Literal(template.clone()),
            }),
            Value::Object(map) => Self::compile_object(map),
            Value::Array(items) => Ok(Expect::Array(
                items.iter().map(Self::compile).collect::<RunnerResult<_>>()?,
            )),
            _ => Ok(Expect::Literal(template.clone())),
        }
    }

    fn compile_object(map: &Map<String, Value>) -> RunnerResult<Self> {
        if let Some(pattern) = map.get(marker::REGEX) {
            let pattern = pattern.as_str().ok_or_else(|| {
                RunnerError::InvalidTemplate(format!("{} expects a string pattern", marker::REGEX))
            })?;
            return Self::regex(pattern);
        }
        if let Some(items) = map.get(marker::UNORDERED) {
            let items = items.as_array().ok_or_else(|| {
                RunnerError::InvalidTemplate(format!("{} expects an array", marker::UNORDERED))
            })?;
            let exact = match map.get(marker::EXACT) {
                None => true,
                Some(Value::Bool(b)) => *b,
                Some(other) => {
                    return Err(RunnerError::InvalidTemplate(format!(
                        "{} expects a boolean, got {}",
                        marker::EXACT,
                        other
                    )))
                }
            };
            return Ok(Expect::Unordered {
                items: items.iter().map(Self::compile).collect::<RunnerResult<_>>()?,
                exact,
            });
        }
        if let Some(value) = map.get(marker::LITERAL) {
            return Ok(Expect::Literal(value.clone()));
        }
        for key in [marker::TOKEN, marker::PARAM] {
            if map.contains_key(key) {
                return Err(RunnerError::InvalidTemplate(format!(
                    "unresolved {} placeholder",
                    key
                )));
            }
        }

        let mut fields = Vec::with_capacity(map.len());
        for (key, value) in map {
            fields.push((key.clone(), Self::compile(value)?));
        }
        Ok(Expect::Object(fields))
    }

    pub fn regex(pattern: &str) -> RunnerResult<Self> {
        Regex::new(pattern)
            .map(Expect::Regex)
            .map_err(|e| RunnerError::InvalidTemplate(format!("bad regex '{}': {}", pattern, e)))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, Expect::Ignore)
    }

    pub fn is_unordered(&self) -> bool {
        matches!(self, Expect::Unordered { .. })
    }

    /// Expectation for `key` of an object template
    pub fn field(&self, key: &str) -> Option<&Expect> {
        match self {
            Expect::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, e)| e),
            _ => None,
        }
    }

    /// Render back into template form, markers included
    pub fn to_template(&self) -> Value {
        match self {
            Expect::Ignore => Value::String(marker::IGNORE.to_string()),
            Expect::Literal(v) if v.is_object() || v.is_array() => {
                let mut map = Map::new();
                map.insert(marker::LITERAL.to_string(), v.clone());
                Value::Object(map)
            }
            Expect::Literal(v) => v.clone(),
            Expect::Regex(re) => {
                let mut map = Map::new();
                map.insert(marker::REGEX.to_string(), Value::String(re.as_str().to_string()));
                Value::Object(map)
            }
            Expect::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_template()))
                    .collect(),
            ),
            Expect::Array(items) => Value::Array(items.iter().map(Expect::to_template).collect()),
            Expect::Unordered { items, exact } => {
                let mut map = Map::new();
                map.insert(
                    marker::UNORDERED.to_string(),
                    Value::Array(items.iter().map(Expect::to_template).collect()),
                );
                map.insert(marker::EXACT.to_string(), Value::Bool(*exact));
                Value::Object(map)
            }
            Expect::LastRequestId => Value::String(marker::LAST_REQUEST_ID.to_string()),
            Expect::LastModuleSessionId => Value::String(marker::LAST_MODULE_SESSION_ID.to_string()),
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_template())
    }
}

/// Session values that match-time placeholders compare against
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchEnv<'a> {
    pub last_request_id: Option<&'a str>,
    pub last_module_session_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location inside a JSON document, rendered as `$.a.b[2]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonPath(Vec<PathSegment>);

impl JsonPath {
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    fn pop(&mut self) {
        self.0.pop();
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MismatchKind {
    NotEqual { expected: Value, actual: Value },
    MissingKey { expected: Value },
    WrongType { expected: &'static str, actual: Value },
    Length { expected: usize, actual: usize },
    Pattern { pattern: String, actual: Value },
    Unmatched { missing: Vec<Value>, actual: Value },
    Unbound(&'static str),
}

/// A path-qualified difference between expectation and actual value
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub path: JsonPath,
    pub kind: MismatchKind,
}

impl Mismatch {
    /// The path of the offending value, e.g. `$.request_state.msg`
    pub fn path(&self) -> String {
        self.path.to_string()
    }

    /// Whether the diff sits on `request_state.type`
    pub fn is_state_type(&self) -> bool {
        matches!(
            self.path.segments(),
            [PathSegment::Key(a), PathSegment::Key(b)] if a == "request_state" && b == "type"
        )
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: ", self.path)?;
        match &self.kind {
            MismatchKind::NotEqual { expected, actual } => {
                write!(f, "expected {}, actual {}", expected, actual)
            }
            MismatchKind::MissingKey { expected } => {
                write!(f, "expected {}, actual <missing>", expected)
            }
            MismatchKind::WrongType { expected, actual } => {
                write!(f, "expected {} value, actual {}", expected, actual)
            }
            MismatchKind::Length { expected, actual } => {
                write!(f, "expected {} item(s), actual {}", expected, actual)
            }
            MismatchKind::Pattern { pattern, actual } => {
                write!(f, "expected match for /{}/, actual {}", pattern, actual)
            }
            MismatchKind::Unmatched { missing, actual } => {
                write!(f, "no partner for {}", Value::Array(missing.clone()))?;
                write!(f, " in {}", actual)
            }
            MismatchKind::Unbound(name) => write!(f, "{} is not set yet", name),
        }
    }
}

/// Check `actual` against `expected`
pub fn matches(expected: &Expect, actual: &Value, env: &MatchEnv<'_>) -> Result<(), Mismatch> {
    let mut path = JsonPath::default();
    match_at(expected, Some(actual), env, &mut path)
}

fn match_at(
    expected: &Expect,
    actual: Option<&Value>,
    env: &MatchEnv<'_>,
    path: &mut JsonPath,
) -> Result<(), Mismatch> {
    if expected.is_ignore() {
        return Ok(());
    }
    let Some(actual) = actual else {
        return fail(path, MismatchKind::MissingKey { expected: expected.to_template() });
    };

    match expected {
        Expect::Ignore => Ok(()),
        Expect::Literal(value) => {
            if values_equal(value, actual) {
                Ok(())
            } else {
                fail(path, MismatchKind::NotEqual { expected: value.clone(), actual: actual.clone() })
            }
        }
        Expect::Regex(re) => {
            let text = match actual {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return fail(path, MismatchKind::WrongType { expected: "string", actual: other.clone() })
                }
            };
            if re.is_match(&text) {
                Ok(())
            } else {
                fail(path, MismatchKind::Pattern { pattern: re.as_str().to_string(), actual: actual.clone() })
            }
        }
        Expect::Object(fields) => {
            let Some(map) = actual.as_object() else {
                return fail(path, MismatchKind::WrongType { expected: "object", actual: actual.clone() });
            };
            for (key, field) in fields {
                path.push(PathSegment::Key(key.clone()));
                match_at(field, map.get(key), env, path)?;
                path.pop();
            }
            Ok(())
        }
        Expect::Array(items) => {
            let Some(array) = actual.as_array() else {
                return fail(path, MismatchKind::WrongType { expected: "array", actual: actual.clone() });
            };
            if array.len() != items.len() {
                return fail(path, MismatchKind::Length { expected: items.len(), actual: array.len() });
            }
            for (index, (item, value)) in items.iter().zip(array).enumerate() {
                path.push(PathSegment::Index(index));
                match_at(item, Some(value), env, path)?;
                path.pop();
            }
            Ok(())
        }
        Expect::Unordered { items, exact } => {
            let Some(array) = actual.as_array() else {
                return fail(path, MismatchKind::WrongType { expected: "array", actual: actual.clone() });
            };
            if *exact && array.len() != items.len() {
                return fail(path, MismatchKind::Length { expected: items.len(), actual: array.len() });
            }
            let unmatched = unmatched_items(items, array, env);
            if unmatched.is_empty() {
                Ok(())
            } else {
                fail(
                    path,
                    MismatchKind::Unmatched {
                        missing: unmatched.into_iter().map(|i| items[i].to_template()).collect(),
                        actual: actual.clone(),
                    },
                )
            }
        }
        Expect::LastRequestId => match_bound("last_request_id", env.last_request_id, actual, path),
        Expect::LastModuleSessionId => {
            match_bound("last_module_session_id", env.last_module_session_id, actual, path)
        }
    }
}

fn fail(path: &JsonPath, kind: MismatchKind) -> Result<(), Mismatch> {
    Err(Mismatch { path: path.clone(), kind })
}

fn match_bound(
    name: &'static str,
    bound: Option<&str>,
    actual: &Value,
    path: &JsonPath,
) -> Result<(), Mismatch> {
    let Some(bound) = bound else {
        return Err(Mismatch { path: path.clone(), kind: MismatchKind::Unbound(name) });
    };
    if actual.as_str() == Some(bound) {
        Ok(())
    } else {
        Err(Mismatch {
            path: path.clone(),
            kind: MismatchKind::NotEqual {
                expected: Value::String(bound.to_string()),
                actual: actual.clone(),
            },
        })
    }
}

/// Indices of expected items left without a distinct actual partner under
/// a maximum bipartite matching.
fn unmatched_items(items: &[Expect], actual: &[Value], env: &MatchEnv<'_>) -> Vec<usize> {
    let compat: Vec<Vec<bool>> = items
        .iter()
        .map(|item| {
            actual
                .iter()
                .map(|value| match_at(item, Some(value), env, &mut JsonPath::default()).is_ok())
                .collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    for left in 0..items.len() {
        let mut seen = vec![false; actual.len()];
        augment(left, &compat, &mut seen, &mut owner);
    }

    let mut matched = vec![false; items.len()];
    for left in owner.into_iter().flatten() {
        matched[left] = true;
    }
    (0..items.len()).filter(|i| !matched[*i]).collect()
}

fn augment(left: usize, compat: &[Vec<bool>], seen: &mut [bool], owner: &mut [Option<usize>]) -> bool {
    for right in 0..owner.len() {
        if compat[left][right] && !seen[right] {
            seen[right] = true;
            let free = match owner[right] {
                None => true,
                Some(other) => augment(other, compat, seen, owner),
            };
            if free {
                owner[right] = Some(left);
                return true;
            }
        }
    }
    false
}

/// Deep equality with numeric comparison across integer/float encodings
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}
