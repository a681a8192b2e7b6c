//! Error types for scenario execution

use thiserror::Error;

use crate::matcher::Mismatch;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Duplicate registration: '{name}' already exists on '{parent}'")]
    DuplicateRegistration { parent: String, name: String },

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Undefined token: {0}")]
    UndefinedToken(String),

    #[error("Invalid token name: '{0}'")]
    InvalidName(String),

    #[error("Unknown script node: {0}")]
    UnknownNode(String),

    #[error("Token conflict at '{0}': a component or node cannot be overwritten")]
    TokenConflict(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Response mismatch: {mismatch}\n  request:  {request}\n  response: {response}")]
    ResponseMismatch {
        mismatch: Mismatch,
        request: String,
        response: String,
    },

    #[error("Backend error: {msg} (code: {code:?}, source: {source_name:?}); {mismatch}")]
    Protocol {
        msg: String,
        code: Option<i64>,
        source_name: Option<String>,
        mismatch: Mismatch,
    },

    #[error("Timeout after {waited_ms}ms waiting for: {expected}")]
    Timeout { waited_ms: u64, expected: String },

    #[error("No response received yet")]
    MissingResponse,

    #[error("Engine must be reset before running another scenario")]
    NotReset,

    #[error("Script failed: {0}")]
    ScriptFailed(String),

    #[error("Scenario spec parse error: {0}")]
    SpecParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] wsstory_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RunnerError {
    /// The structural diff behind a validation failure, if any
    pub fn mismatch(&self) -> Option<&Mismatch> {
        match self {
            RunnerError::ResponseMismatch { mismatch, .. } | RunnerError::Protocol { mismatch, .. } => {
                Some(mismatch)
            }
            _ => None,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
