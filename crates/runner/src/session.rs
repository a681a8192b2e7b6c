//! Session client: one logical connection to a backend
//!
//! Tracks the last request id, the last request and response, and the last
//! module session id announced by the backend. Exchanges are strictly
//! sequential: anything still queued when a new request is sent is stale
//! and gets drained first.

use futures::FutureExt;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use wsstory_common::protocol::is_terminal_message;
use wsstory_common::{Connector, Greeting, Response, StateType, Transport};

use crate::error::{RunnerError, RunnerResult};
use crate::matcher::{self, Expect, MatchEnv, Mismatch, MismatchKind};
use crate::template::marker;

/// Session behaviour knobs, usually taken from `RunnerConfig`
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounded wait for each inbound message
    pub response_timeout: Duration,
    /// Read the backend's greeting right after connecting
    pub expect_greeting: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            expect_greeting: true,
        }
    }
}

pub struct Session {
    transport: Box<dyn Transport>,
    options: SessionOptions,
    session_id: Option<String>,
    last_request_id: Option<String>,
    last_request: Option<Value>,
    last_response: Option<Value>,
    last_module_session_id: Option<String>,
}

impl Session {
    /// Wrap a connected transport, reading the greeting if configured to
    pub async fn open(transport: Box<dyn Transport>, options: SessionOptions) -> RunnerResult<Self> {
        let mut session = Self {
            transport,
            options,
            session_id: None,
            last_request_id: None,
            last_request: None,
            last_response: None,
            last_module_session_id: None,
        };
        if session.options.expect_greeting {
            session.read_greeting().await?;
        }
        Ok(session)
    }

    pub async fn connect(connector: &dyn Connector, options: SessionOptions) -> RunnerResult<Self> {
        let transport = connector.connect().await?;
        Self::open(transport, options).await
    }

    /// Drop the current connection and all session state, then connect anew
    pub async fn reconnect(&mut self, connector: &dyn Connector) -> RunnerResult<()> {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.close().await {
                debug!("Ignoring close error on reconnect: {}", e);
            }
        }
        self.transport = connector.connect().await?;
        self.session_id = None;
        self.last_request_id = None;
        self.last_request = None;
        self.last_response = None;
        self.last_module_session_id = None;
        if self.options.expect_greeting {
            self.read_greeting().await?;
        }
        Ok(())
    }

    async fn read_greeting(&mut self) -> RunnerResult<()> {
        let value = self.next_message("connection greeting").await?;
        let greeting: Greeting = serde_json::from_value(value)?;
        if greeting.request_state.state != StateType::Ok {
            return Err(RunnerError::Transport(wsstory_common::Error::Transport(format!(
                "backend refused the session: {}",
                greeting.request_state.msg
            ))));
        }
        info!(
            "Session established: {}",
            greeting.session_uuid.as_deref().unwrap_or("<no session id>")
        );
        self.session_id = greeting.session_uuid;
        self.last_response = None;
        Ok(())
    }

    /// Fresh unique request id; becomes the last request id
    pub fn generate_request_id(&mut self) -> String {
        let id = Uuid::new_v4().to_string();
        self.last_request_id = Some(id.clone());
        id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_request_id(&self) -> RunnerResult<&str> {
        self.last_request_id
            .as_deref()
            .ok_or_else(|| RunnerError::UndefinedToken("last_request_id".to_string()))
    }

    pub fn last_module_session_id(&self) -> RunnerResult<&str> {
        self.last_module_session_id
            .as_deref()
            .ok_or_else(|| RunnerError::UndefinedToken("last_module_session_id".to_string()))
    }

    pub fn last_request(&self) -> Option<&Value> {
        self.last_request.as_ref()
    }

    pub fn last_response(&self) -> Option<&Value> {
        self.last_response.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&mut self) -> RunnerResult<()> {
        self.transport.close().await?;
        Ok(())
    }

    /// Values match-time placeholders compare against
    pub fn env(&self) -> MatchEnv<'_> {
        MatchEnv {
            last_request_id: self.last_request_id.as_deref(),
            last_module_session_id: self.last_module_session_id.as_deref(),
        }
    }

    /// Serialize and transmit without waiting for a reply
    pub async fn send(&mut self, message: Value) -> RunnerResult<()> {
        self.drain_stale()?;

        let message = self.prepare(message)?;
        if let Some(id) = message.get("request_id").and_then(Value::as_str) {
            self.last_request_id = Some(id.to_string());
        }
        let text = serde_json::to_string(&message)?;
        let verb = message.get("request").and_then(|v| v.as_str()).unwrap_or("<message>");
        let command = message.get("command").and_then(|v| v.as_str()).unwrap_or("");
        debug!("Sending {} {}", verb, command);
        trace!("=> {}", text);

        self.last_request = Some(message);
        self.last_response = None;
        self.transport.send_text(text).await?;
        Ok(())
    }

    /// Wait for the next inbound message
    pub async fn receive(&mut self) -> RunnerResult<Value> {
        self.next_message("next response").await
    }

    /// Wait for the next message and validate it against `expected`
    pub async fn expect_next(&mut self, expected: &Expect) -> RunnerResult<Value> {
        let actual = self.next_message(&expected.to_string()).await?;
        if !expected.is_ignore() {
            self.validate(&actual, expected)?;
        }
        Ok(actual)
    }

    /// Send, then consume exactly one response per expectation, in order.
    ///
    /// A single unordered expectation instead collects the whole exchange
    /// up to its terminal response and matches it as a multiset.
    pub async fn send_and_validate(&mut self, message: Value, expected: &[Expect]) -> RunnerResult<Vec<Value>> {
        if let [only] = expected {
            if only.is_unordered() {
                return self.send_and_collect(message, only).await;
            }
        }

        self.send(message).await?;
        let total = expected.len();
        let mut responses = Vec::with_capacity(total);
        for (index, exp) in expected.iter().enumerate() {
            let actual = self
                .next_message(&format!("response {} of {}: {}", index + 1, total, exp))
                .await?;
            if !exp.is_ignore() {
                self.validate(&actual, exp)?;
            }
            responses.push(actual);
        }
        Ok(responses)
    }

    /// Send, read until a terminal response, then match the collected list
    pub async fn send_and_collect(&mut self, message: Value, expected: &Expect) -> RunnerResult<Vec<Value>> {
        self.send(message).await?;
        let mut responses = Vec::new();
        loop {
            let actual = self.next_message(&format!("terminal response for {}", expected)).await?;
            let terminal = is_terminal_message(&actual);
            responses.push(actual);
            if terminal {
                break;
            }
        }

        let collected = Value::Array(responses);
        self.validate(&collected, expected)?;
        match collected {
            Value::Array(responses) => Ok(responses),
            _ => Ok(Vec::new()),
        }
    }

    /// Validate the already received last response without waiting
    pub fn validate_last_response(&self, expected: &Expect) -> RunnerResult<&Value> {
        let last = self.last_response.as_ref().ok_or(RunnerError::MissingResponse)?;
        self.validate(last, expected)?;
        Ok(last)
    }

    fn validate(&self, actual: &Value, expected: &Expect) -> RunnerResult<()> {
        matcher::matches(expected, actual, &self.env()).map_err(|m| self.mismatch_error(m, expected, actual))
    }

    fn mismatch_error(&self, mismatch: Mismatch, expected: &Expect, actual: &Value) -> RunnerError {
        if let MismatchKind::Unbound(name) = mismatch.kind {
            return RunnerError::UndefinedToken(name.to_string());
        }

        if mismatch.is_state_type() || expects_non_error_state(expected) {
            if let Ok(response) = Response::from_value(actual) {
                if response.is_error() {
                    return RunnerError::Protocol {
                        msg: response.request_state.msg,
                        code: response.request_state.code,
                        source_name: response.request_state.source,
                        mismatch,
                    };
                }
            }
        }

        RunnerError::ResponseMismatch {
            mismatch,
            request: self
                .last_request
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "<none>".to_string()),
            response: actual.to_string(),
        }
    }

    async fn next_message(&mut self, expected: &str) -> RunnerResult<Value> {
        let window = self.options.response_timeout;
        let text = match timeout(window, self.transport.recv_text()).await {
            Err(_) => {
                return Err(RunnerError::Timeout {
                    waited_ms: window.as_millis() as u64,
                    expected: expected.to_string(),
                })
            }
            Ok(received) => received?.ok_or(wsstory_common::Error::ConnectionClosed)?,
        };
        trace!("<= {}", text);

        let value: Value = serde_json::from_str(&text)?;
        self.observe(&value);
        self.last_response = Some(value.clone());
        Ok(value)
    }

    /// Pick up correlation data from any inbound message
    fn observe(&mut self, value: &Value) {
        let Ok(response) = Response::from_value(value) else {
            return;
        };
        if let Some(id) = response.announced_module_session_id() {
            if self.last_module_session_id.as_deref() != Some(id) {
                debug!("Module session id is now {}", id);
                self.last_module_session_id = Some(id.to_string());
            }
        }
        if let (Some(id), Some(expected)) = (response.request_id.as_deref(), self.last_request_id.as_deref()) {
            if id != expected {
                debug!("Response for request {} while waiting on {}", id, expected);
            }
        }
    }

    /// Discard messages that arrived after the previous exchange ended
    fn drain_stale(&mut self) -> RunnerResult<()> {
        loop {
            match self.transport.recv_text().now_or_never() {
                Some(Ok(Some(text))) => {
                    warn!("Discarding stale message: {}", text);
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        self.observe(&value);
                    }
                }
                Some(Ok(None)) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Substitute outgoing markers. One fresh id is generated per message.
    fn prepare(&mut self, message: Value) -> RunnerResult<Value> {
        let mut generated: Option<String> = None;
        self.substitute(message, &mut generated)
    }

    fn substitute(&mut self, value: Value, generated: &mut Option<String>) -> RunnerResult<Value> {
        match value {
            Value::String(s) if s == marker::GENERATE_REQUEST_ID => {
                let id = match generated {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.generate_request_id();
                        *generated = Some(id.clone());
                        id
                    }
                };
                Ok(Value::String(id))
            }
            Value::String(s) if s == marker::LAST_REQUEST_ID => {
                Ok(Value::String(self.last_request_id()?.to_string()))
            }
            Value::String(s) if s == marker::LAST_MODULE_SESSION_ID => {
                Ok(Value::String(self.last_module_session_id()?.to_string()))
            }
            Value::Object(mut map) if map.len() == 1 && map.contains_key(marker::LITERAL) => {
                Ok(map.remove(marker::LITERAL).unwrap_or(Value::Null))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let item = self.substitute(item, generated)?;
                    out.insert(key, item);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| self.substitute(item, generated))
                    .collect::<RunnerResult<_>>()?,
            )),
            other => Ok(other),
        }
    }
}

/// Whether the template pins `request_state.type` to something other than `ERROR`
fn expects_non_error_state(expected: &Expect) -> bool {
    match expected.field("request_state").and_then(|s| s.field("type")) {
        Some(Expect::Literal(Value::String(state))) => state != "ERROR",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template;
    use serde_json::json;
    use wsstory_common::channel_pair;

    async fn session_without_greeting() -> (Session, wsstory_common::ChannelTransport) {
        let (client, server) = channel_pair();
        let options = SessionOptions {
            response_timeout: Duration::from_millis(200),
            expect_greeting: false,
        };
        let session = Session::open(Box::new(client), options).await.unwrap();
        (session, server)
    }

    #[tokio::test]
    async fn test_greeting_records_session_id() {
        let (client, mut server) = channel_pair();
        server
            .send_text(
                json!({"request_state": {"type": "OK", "msg": "A new session has been created"}, "session_uuid": "s-1"})
                    .to_string(),
            )
            .await
            .unwrap();
        let session = Session::open(Box::new(client), SessionOptions::default()).await.unwrap();
        assert_eq!(session.session_id(), Some("s-1"));
        assert!(session.last_response().is_none());
    }

    #[tokio::test]
    async fn test_send_substitutes_generated_id() {
        let (mut session, mut server) = session_without_greeting().await;
        session
            .send(json!({"request": "logout", "request_id": template::generate_request_id()}))
            .await
            .unwrap();

        let sent: Value = serde_json::from_str(&server.recv_text().await.unwrap().unwrap()).unwrap();
        let id = sent["request_id"].as_str().unwrap();
        assert_eq!(session.last_request_id().unwrap(), id);
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_send_unwraps_literal_values() {
        let (mut session, mut server) = session_without_greeting().await;
        session
            .send(json!({
                "request": "execute",
                "args": {"sql": template::literal(json!("$last_request_id")), "params": template::literal(json!([1]))}
            }))
            .await
            .unwrap();

        let sent: Value = serde_json::from_str(&server.recv_text().await.unwrap().unwrap()).unwrap();
        assert_eq!(sent["args"], json!({"sql": "$last_request_id", "params": [1]}));
    }

    #[tokio::test]
    async fn test_unset_module_session_id_is_undefined() {
        let (mut session, _server) = session_without_greeting().await;
        let err = session
            .send(json!({"args": {"module_session_id": template::last_module_session_id()}}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::UndefinedToken(t) if t == "last_module_session_id"));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (mut session, _server) = session_without_greeting().await;
        let err = session.receive().await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { waited_ms: 200, .. }));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_receive() {
        let (mut session, mut server) = session_without_greeting().await;
        server.close().await.unwrap();
        let err = session.receive().await.unwrap_err();
        assert!(matches!(err, RunnerError::Transport(wsstory_common::Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_stale_messages_are_drained() {
        let (mut session, mut server) = session_without_greeting().await;
        server.send_text(json!({"stale": true}).to_string()).await.unwrap();
        tokio::task::yield_now().await;

        session.send(json!({"request": "logout"})).await.unwrap();
        server.send_text(json!({"fresh": true}).to_string()).await.unwrap();
        assert_eq!(session.receive().await.unwrap(), json!({"fresh": true}));
    }

    #[tokio::test]
    async fn test_module_session_capture_skips_prompts() {
        let (mut session, mut server) = session_without_greeting().await;
        server
            .send_text(json!({"request_state": {"type": "PENDING", "msg": ""}, "result": {"module_session_id": "m-1"}}).to_string())
            .await
            .unwrap();
        server
            .send_text(
                json!({"request_state": {"type": "PENDING", "msg": ""}, "result": {"prompt": "Password:", "module_session_id": "m-2"}})
                    .to_string(),
            )
            .await
            .unwrap();
        session.receive().await.unwrap();
        session.receive().await.unwrap();
        assert_eq!(session.last_module_session_id().unwrap(), "m-1");
    }

    #[tokio::test]
    async fn test_validate_last_response_without_response() {
        let (session, _server) = session_without_greeting().await;
        let err = session.validate_last_response(&Expect::Ignore).unwrap_err();
        assert!(matches!(err, RunnerError::MissingResponse));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_protocol_error() {
        let (mut session, mut server) = session_without_greeting().await;
        server
            .send_text(
                json!({"request_state": {"type": "ERROR", "msg": "boom", "code": 1500, "source": "MSG"}}).to_string(),
            )
            .await
            .unwrap();
        session.receive().await.unwrap();

        let expected = Expect::compile(&json!({"request_state": {"type": "OK"}})).unwrap();
        match session.validate_last_response(&expected).unwrap_err() {
            RunnerError::Protocol { msg, code, source_name, .. } => {
                assert_eq!(msg, "boom");
                assert_eq!(code, Some(1500));
                assert_eq!(source_name.as_deref(), Some("MSG"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let expected = Expect::compile(&json!({"request_state": {"type": "OK", "msg": "fine"}})).unwrap();
        let err = session.validate_last_response(&expected).unwrap_err();
        assert!(matches!(err, RunnerError::Protocol { .. }), "{err}");

        let expected = Expect::compile(&json!({"request_state": {"type": "ERROR", "msg": "other"}})).unwrap();
        let err = session.validate_last_response(&expected).unwrap_err();
        assert!(matches!(err, RunnerError::ResponseMismatch { .. }), "{err}");
    }
}
