//! `lib.dbsession`: database sessions opened straight on a stored connection

use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::Context;
use crate::error::RunnerResult;
use crate::namespace::Namespace;
use crate::node::{CallFrame, ScriptBody};
use crate::template::{ignore, last_module_session_id};

use super::sqleditor::CONNECTION_OPENED_MSG;
use super::{done, execute_request, module_session_id, pending, register_component};

pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    register_component(
        namespace,
        "dbsession",
        vec![
            ("open_db_session", Arc::new(OpenDbSession) as Arc<dyn ScriptBody>),
            ("close_db_session", Arc::new(CloseDbSession)),
        ],
    )
}

/// Open a session on `params.connection_id`.
/// Result: `module_session_id`, `info`, `default_schema`.
pub struct OpenDbSession;

#[async_trait::async_trait]
impl ScriptBody for OpenDbSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let connection = frame.param("connection_id")?.clone();

        let mut opened = pending(json!(CONNECTION_OPENED_MSG));
        opened["result"] = json!({
            "module_session_id": module_session_id(),
            "info": ignore(),
            "default_schema": ignore(),
        });

        let responses = cx
            .send_and_validate(
                frame,
                execute_request("gui.db.start_session", json!({"connection": connection})),
                vec![opened, done(json!(""))],
            )
            .await?;

        let id = cx.session().last_module_session_id()?.to_string();
        frame.set_result("module_session_id", Value::String(id));
        if let Some(result) = responses.first().and_then(|r| r.get("result")) {
            for key in ["info", "default_schema"] {
                if let Some(value) = result.get(key) {
                    frame.set_result(key, value.clone());
                }
            }
        }
        Ok(())
    }
}

pub struct CloseDbSession;

#[async_trait::async_trait]
impl ScriptBody for CloseDbSession {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let id = frame.param_or("module_session_id", last_module_session_id());
        cx.send_and_validate(
            frame,
            execute_request("gui.db.close_session", json!({"module_session_id": id})),
            vec![done(json!(""))],
        )
        .await?;
        Ok(())
    }
}
