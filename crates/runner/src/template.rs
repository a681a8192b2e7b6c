//! Template markers and placeholder resolution
//!
//! Requests and expectations are written as plain JSON. Markers are encoded
//! as reserved strings or single-purpose objects so that templates stay
//! serializable and can live in declarative scenario files.

use serde_json::{Map, Value};

use crate::error::{RunnerError, RunnerResult};
use crate::namespace::Namespace;

pub mod marker {
    pub const IGNORE: &str = "$ignore";
    pub const REGEX: &str = "$regex";
    pub const UNORDERED: &str = "$unordered";
    pub const EXACT: &str = "$exact";
    pub const LITERAL: &str = "$literal";
    pub const TOKEN: &str = "$token";
    pub const PARAM: &str = "$param";
    pub const GENERATE_REQUEST_ID: &str = "$generate_request_id";
    pub const LAST_REQUEST_ID: &str = "$last_request_id";
    pub const LAST_MODULE_SESSION_ID: &str = "$last_module_session_id";
}

/// Matches any value, including a missing key
pub fn ignore() -> Value {
    Value::String(marker::IGNORE.to_string())
}

/// Matches text containing `pattern`
pub fn regex(pattern: &str) -> Value {
    object([(marker::REGEX, Value::String(pattern.to_string()))])
}

/// Matches an array as a multiset of `items`; `exact = false` allows extras
pub fn unordered(items: Vec<Value>, exact: bool) -> Value {
    object([(marker::UNORDERED, Value::Array(items)), (marker::EXACT, Value::Bool(exact))])
}

/// Matches `value` by full deep equality, markers inside it included
pub fn literal(value: Value) -> Value {
    object([(marker::LITERAL, value)])
}

/// Replaced by the value stored at `path` in the token namespace
pub fn token(path: &str) -> Value {
    object([(marker::TOKEN, Value::String(path.to_string()))])
}

/// Replaced by the named parameter of the current invocation
pub fn param(name: &str) -> Value {
    object([(marker::PARAM, Value::String(name.to_string()))])
}

/// Replaced by a fresh request id when the message is sent
pub fn generate_request_id() -> Value {
    Value::String(marker::GENERATE_REQUEST_ID.to_string())
}

pub fn last_request_id() -> Value {
    Value::String(marker::LAST_REQUEST_ID.to_string())
}

pub fn last_module_session_id() -> Value {
    Value::String(marker::LAST_MODULE_SESSION_ID.to_string())
}

/// Replace `$token` and `$param` placeholders. Other markers are kept for
/// the session (outgoing ids) or the matcher (match-time values).
pub fn resolve(template: &Value, namespace: &Namespace, params: &Map<String, Value>) -> RunnerResult<Value> {
    match template {
        Value::Object(map) => {
            if map.contains_key(marker::LITERAL) {
                return Ok(template.clone());
            }
            if let Some(path) = single_key(map, marker::TOKEN) {
                return namespace.get(path);
            }
            if let Some(name) = single_key(map, marker::PARAM) {
                return params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RunnerError::UndefinedToken(format!("params.{}", name)));
            }
            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, namespace, params)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve(item, namespace, params))
                .collect::<RunnerResult<_>>()?,
        )),
        _ => Ok(template.clone()),
    }
}

fn object<const N: usize>(pairs: [(&str, Value); N]) -> Value {
    Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn single_key<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    if map.len() == 1 {
        map.get(key)?.as_str()
    } else {
        None
    }
}
