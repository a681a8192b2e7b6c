//! `lib.sqleditor`: SQL editor module sessions

use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::Context;
use crate::error::RunnerResult;
use crate::namespace::Namespace;
use crate::node::{params, CallFrame, Params, ScriptBody};
use crate::template::{ignore, last_module_session_id, regex};

use super::{done, execute_request, module_session_id, ok, pending, register_component};

pub const CONNECTION_OPENED_MSG: &str = "Connection was successfully opened.";

pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    register_component(
        namespace,
        "sqleditor",
        vec![
            ("open_session", Arc::new(OpenSession) as Arc<dyn ScriptBody>),
            ("close_session", Arc::new(CloseSession)),
            ("open_connection", Arc::new(OpenConnection)),
            (
                "open_connection_validate_mysql",
                Arc::new(ValidatedOpen {
                    default_schema: ignore(),
                    version: "^\\d+\\.\\d+\\.\\d+",
                }),
            ),
            (
                "open_connection_validate_mysqlx",
                Arc::new(ValidatedOpen {
                    default_schema: ignore(),
                    version: "^\\d+\\.\\d+\\.\\d+",
                }),
            ),
            ("create_test_sessions", Arc::new(CreateTestSessions)),
            (
                "open_connection_validate_sqlite",
                Arc::new(ValidatedOpen {
                    default_schema: json!("main"),
                    version: "^\\d+\\.\\d+\\.\\d+",
                }),
            ),
        ],
    )
}

/// Start a session; result: `module_session_id`
pub struct OpenSession;

#[async_trait::async_trait]
impl ScriptBody for OpenSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let mut announced = pending(ignore());
        announced["result"] = json!({"module_session_id": module_session_id()});

        cx.send_and_validate(
            frame,
            execute_request("gui.sqleditor.start_session", json!({})),
            vec![announced, done(ignore())],
        )
        .await?;

        let id = cx.session().last_module_session_id()?.to_string();
        frame.set_result("module_session_id", Value::String(id));
        Ok(())
    }
}

/// Close `params.module_session_id`, defaulting to the last announced one
pub struct CloseSession;

#[async_trait::async_trait]
impl ScriptBody for CloseSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let id = frame.param_or("module_session_id", last_module_session_id());
        cx.send_and_validate(
            frame,
            execute_request("gui.sqleditor.close_session", json!({"module_session_id": id})),
            vec![ok(ignore())],
        )
        .await?;
        Ok(())
    }
}

/// Open `params.connection_id` in a session.
///
/// `params.expected` replaces the default single `OK` expectation.
/// Result: `info`, `default_schema`.
pub struct OpenConnection;

#[async_trait::async_trait]
impl ScriptBody for OpenConnection {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let args = json!({
            "db_connection_id": frame.param("connection_id")?.clone(),
            "module_session_id": frame.param_or("module_session_id", last_module_session_id()),
        });
        let expected = match frame.params().get("expected") {
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
            None => vec![ok(json!(CONNECTION_OPENED_MSG))],
        };

        let responses = cx
            .send_and_validate(
                frame,
                execute_request("gui.sqleditor.open_connection", args),
                expected,
            )
            .await?;

        if let Some(last) = responses.last() {
            for key in ["info", "default_schema"] {
                if let Some(value) = last.get(key).or_else(|| last.pointer(&format!("/result/{}", key))) {
                    frame.set_result(key, value.clone());
                }
            }
        }
        Ok(())
    }
}

/// `open_connection` with a check on the reported server info
pub struct ValidatedOpen {
    default_schema: Value,
    version: &'static str,
}

#[async_trait::async_trait]
impl ScriptBody for ValidatedOpen {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let mut expected = ok(json!(CONNECTION_OPENED_MSG));
        expected["info"] = json!({"version": regex(self.version)});
        expected["default_schema"] = frame.param_or("default_schema", self.default_schema.clone());

        let mut forwarded: Params = frame.params().clone();
        forwarded.insert("expected".to_string(), expected);
        let result = cx.execute("lib.sqleditor.open_connection", forwarded).await?;
        for (key, value) in result {
            frame.set_result(key, value);
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["lib.sqleditor.open_connection".to_string()]
    }
}

/// Open `params.count` sessions (default 1), each with `params.connection_id`
/// opened in it. Result: `module_session_ids`, plus `module_session_id` for
/// the last one.
pub struct CreateTestSessions;

#[async_trait::async_trait]
impl ScriptBody for CreateTestSessions {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let connection_id = frame.param("connection_id")?.clone();
        let count = frame.param_or("count", json!(1)).as_u64().unwrap_or(1);

        let mut ids = Vec::new();
        for _ in 0..count {
            let opened = cx.execute("lib.sqleditor.open_session", Params::new()).await?;
            let id = opened.get("module_session_id").cloned().unwrap_or(Value::Null);
            cx.execute(
                "lib.sqleditor.open_connection",
                params([
                    ("connection_id", connection_id.clone()),
                    ("module_session_id", id.clone()),
                ]),
            )
            .await?;
            ids.push(id);
        }

        frame.set_result("module_session_id", ids.last().cloned().unwrap_or(Value::Null));
        frame.set_result("module_session_ids", Value::Array(ids));
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec![
            "lib.sqleditor.open_session".to_string(),
            "lib.sqleditor.open_connection".to_string(),
        ]
    }
}
