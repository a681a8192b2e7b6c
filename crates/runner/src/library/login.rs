//! `lib.login`: authentication against the backend

use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::Context;
use crate::error::RunnerResult;
use crate::namespace::Namespace;
use crate::node::{params, CallFrame, ScriptBody};
use crate::template::{generate_request_id, ignore};

use super::{ok, register_component};

pub const ADMIN_USER: &str = "admin1";
pub const ADMIN_PASSWORD: &str = "admin1";

/// Name of the profile every new user starts with
pub const DEFAULT_PROFILE: &str = "Default";

pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    register_component(
        namespace,
        "login",
        vec![
            ("login", Arc::new(Login) as Arc<dyn ScriptBody>),
            ("admin", Arc::new(Admin)),
            ("logout", Arc::new(Logout)),
        ],
    )
}

/// Authenticate `params.user` with `params.password`.
/// Result: `user`, `active_profile`.
pub struct Login;

#[async_trait::async_trait]
impl ScriptBody for Login {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let user = frame.param_str("user")?.to_string();
        let password = frame.param("password")?.clone();

        let mut expected = ok(json!(format!("User {} was successfully authenticated.", user)));
        expected["active_profile"] = ignore();

        let responses = cx
            .send_and_validate(
                frame,
                json!({
                    "request": "authenticate",
                    "request_id": generate_request_id(),
                    "username": user,
                    "password": password,
                }),
                vec![expected],
            )
            .await?;

        let profile = responses
            .first()
            .and_then(|r| r.get("active_profile"))
            .cloned()
            .unwrap_or(Value::Null);
        frame.set_result("user", Value::String(user));
        frame.set_result("active_profile", profile);
        Ok(())
    }
}

/// Log in as the administrator and check the default profile is active
pub struct Admin;

#[async_trait::async_trait]
impl ScriptBody for Admin {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let result = cx
            .execute(
                "lib.login.login",
                params([("user", json!(ADMIN_USER)), ("password", json!(ADMIN_PASSWORD))]),
            )
            .await?;
        cx.validate_last_response(frame, &json!({"active_profile": {"name": DEFAULT_PROFILE}}))?;

        frame.set_result("active_profile", result.get("active_profile").cloned().unwrap_or(Value::Null));
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["lib.login.login".to_string()]
    }
}

pub struct Logout;

#[async_trait::async_trait]
impl ScriptBody for Logout {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        cx.send_and_validate(
            frame,
            json!({"request": "logout", "request_id": generate_request_id()}),
            vec![ok(json!("User successfully logged out."))],
        )
        .await?;
        Ok(())
    }
}
