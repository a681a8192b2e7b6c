//! Request/response wire protocol
//!
//! Every message is a single JSON object. Requests carry a verb and a
//! request id; a request may be answered by several responses sharing that
//! id, starting with zero or more `PENDING` messages and ending with `OK`
//! or `ERROR` (optionally flagged `done`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message sent by the backend when a request is issued before `authenticate`
pub const NOT_AUTHENTICATED_MSG: &str = "This session is not yet authenticated.";

/// Message sent by the backend when an `execute` request lacks a command
pub const NO_COMMAND_MSG: &str = "No command given. Please provide the command.";

/// Message carried by the greeting that opens every connection
pub const NEW_SESSION_MSG: &str = "A new session has been created";

/// Request verbs understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Authenticate,
    Execute,
    Logout,
    Cancel,
    PromptReply,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Authenticate => "authenticate",
            Verb::Execute => "execute",
            Verb::Logout => "logout",
            Verb::Cancel => "cancel",
            Verb::PromptReply => "prompt_reply",
        }
    }
}

/// An outgoing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request: Verb,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    /// Verb specific top-level fields (`username`, `password`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    /// Build an `authenticate` request
    pub fn authenticate(
        request_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut extra = Map::new();
        extra.insert("username".to_string(), Value::String(username.into()));
        extra.insert("password".to_string(), Value::String(password.into()));
        Self {
            request: Verb::Authenticate,
            request_id: request_id.into(),
            command: None,
            args: None,
            extra,
        }
    }

    /// Build an `execute` request for a dotted command path
    pub fn execute(
        request_id: impl Into<String>,
        command: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            request: Verb::Execute,
            request_id: request_id.into(),
            command: Some(command.into()),
            args: Some(args),
            extra: Map::new(),
        }
    }

    /// Build a `logout` request
    pub fn logout(request_id: impl Into<String>) -> Self {
        Self {
            request: Verb::Logout,
            request_id: request_id.into(),
            command: None,
            args: None,
            extra: Map::new(),
        }
    }

    /// Convert into a raw JSON value
    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// State reported by `request_state.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Ok,
    Error,
    Pending,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// The `request_state` block of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestState {
    #[serde(rename = "type")]
    pub state: StateType,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A typed view over an incoming response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub request_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    /// Parse a response out of a raw JSON value
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    /// Build a response with the given state
    pub fn new(request_id: Option<String>, state: StateType, msg: impl Into<String>) -> Self {
        Self {
            request_id,
            request_state: RequestState {
                state,
                msg: msg.into(),
                code: None,
                source: None,
            },
            result: None,
            done: false,
            module_session_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    /// Whether this response ends its exchange
    pub fn is_terminal(&self) -> bool {
        self.done
            || matches!(
                self.request_state.state,
                StateType::Ok | StateType::Error | StateType::Cancelled
            )
    }

    pub fn is_error(&self) -> bool {
        self.request_state.state == StateType::Error
    }

    /// The module session id announced by this response, if any.
    ///
    /// Prompt responses also carry a `module_session_id` inside `result`;
    /// those refer to the prompting session and are not announcements.
    pub fn announced_module_session_id(&self) -> Option<&str> {
        if let Some(id) = self.module_session_id.as_deref() {
            return Some(id);
        }
        let result = self.result.as_ref()?.as_object()?;
        if result.contains_key("prompt") {
            return None;
        }
        result.get("module_session_id")?.as_str()
    }

    /// Convert into a raw JSON value
    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Terminal check on a raw message, tolerant of malformed payloads
pub fn is_terminal_message(value: &Value) -> bool {
    Response::from_value(value)
        .map(|r| r.is_terminal())
        .unwrap_or(false)
}

/// First message sent by the backend on a new connection
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    pub request_state: RequestState,
    #[serde(default)]
    pub session_uuid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_serialization() {
        let mut args = Map::new();
        args.insert("connection".to_string(), json!(1));
        let request = Request::execute("abc", "gui.db.start_session", args);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["request"], "execute");
        assert_eq!(json["request_id"], "abc");
        assert_eq!(json["command"], "gui.db.start_session");
        assert_eq!(json["args"]["connection"], 1);
    }

    #[test]
    fn test_authenticate_request_flattens_credentials() {
        let request = Request::authenticate("id-1", "admin1", "secret");
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"username\":\"admin1\""));
        assert!(json.contains("\"password\":\"secret\""));
        assert!(!json.contains("\"command\""));
    }

    #[test]
    fn test_response_parsing() {
        let value = json!({
            "request_id": "r1",
            "request_state": {"type": "PENDING", "msg": "Execution started..."},
            "result": {"module_session_id": "m1"}
        });
        let response = Response::from_value(&value).unwrap();
        assert_eq!(response.request_state.state, StateType::Pending);
        assert!(!response.is_terminal());
        assert_eq!(response.announced_module_session_id(), Some("m1"));
    }

    #[test]
    fn test_done_flag_is_terminal() {
        let value = json!({
            "request_id": "r1",
            "request_state": {"type": "PENDING", "msg": ""},
            "done": true
        });
        assert!(is_terminal_message(&value));
    }

    #[test]
    fn test_prompt_result_does_not_announce_session() {
        let value = json!({
            "request_state": {"type": "PENDING", "msg": ""},
            "result": {"prompt": "Password:", "module_session_id": "m2"}
        });
        let response = Response::from_value(&value).unwrap();
        assert_eq!(response.announced_module_session_id(), None);
    }

    #[test]
    fn test_unknown_state_type() {
        let value = json!({"request_state": {"type": "WEIRD", "msg": "?"}});
        let response = Response::from_value(&value).unwrap();
        assert_eq!(response.request_state.state, StateType::Unknown);
        assert!(!response.is_terminal());
    }

    #[test]
    fn test_error_code_and_source() {
        let value = json!({
            "request_id": "r9",
            "request_state": {"type": "ERROR", "msg": "boom", "code": 1045, "source": "MySQL"}
        });
        let response = Response::from_value(&value).unwrap();
        assert!(response.is_error());
        assert_eq!(response.request_state.code, Some(1045));
        assert_eq!(response.request_state.source.as_deref(), Some("MySQL"));
    }
}
