//! `lib.shell`: interactive shell module sessions

use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::Context;
use crate::error::RunnerResult;
use crate::namespace::Namespace;
use crate::node::{CallFrame, ScriptBody};
use crate::template::{ignore, last_module_session_id};

use super::{execute_request, module_session_id, ok, pending, register_component};

pub const SHELL_SESSION_CREATED_MSG: &str = "New Shell Interactive session created successfully.";

pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    register_component(
        namespace,
        "shell",
        vec![
            ("open_session", Arc::new(OpenSession) as Arc<dyn ScriptBody>),
            ("close_session", Arc::new(CloseSession)),
        ],
    )
}

/// Start a shell session, optionally on `params.connection_id`.
/// Result: `module_session_id`.
pub struct OpenSession;

#[async_trait::async_trait]
impl ScriptBody for OpenSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let mut args = json!({});
        if let Some(connection) = frame.params().get("connection_id") {
            args["db_connection_id"] = connection.clone();
        }

        let mut announced = pending(ignore());
        announced["result"] = json!({"module_session_id": module_session_id()});

        cx.send_and_validate(
            frame,
            execute_request("gui.shell.start_session", args),
            vec![announced, ok(json!(SHELL_SESSION_CREATED_MSG))],
        )
        .await?;

        let id = cx.session().last_module_session_id()?.to_string();
        frame.set_result("module_session_id", Value::String(id));
        Ok(())
    }
}

pub struct CloseSession;

#[async_trait::async_trait]
impl ScriptBody for CloseSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let id = frame.param_or("module_session_id", last_module_session_id());
        cx.send_and_validate(
            frame,
            execute_request("gui.shell.close_session", json!({"module_session_id": id})),
            vec![ok(ignore())],
        )
        .await?;
        Ok(())
    }
}
