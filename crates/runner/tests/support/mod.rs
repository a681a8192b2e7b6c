//! In-process backend speaking the JSON request/response protocol
//!
//! Implements just enough of the backend for the built-in library:
//! authentication, stored connections and module sessions. A few `test.*`
//! commands exercise the engine's exchange handling.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wsstory_common::protocol::{NEW_SESSION_MSG, NOT_AUTHENTICATED_MSG, NO_COMMAND_MSG};
use wsstory_common::{channel_pair, ChannelTransport, Connector, Transport};
use wsstory_runner::{RunnerConfig, TestRunner};

pub const UNSUPPORTED_MSG: &str = "The requested command is not supported.";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Connector spawning a fresh backend for every connection
pub fn connector() -> Arc<dyn Connector> {
    Arc::new(|| -> wsstory_common::Result<Box<dyn Transport>> { Ok(Box::new(spawn_backend())) })
}

/// Runner against the fake backend with a short response timeout
pub fn runner() -> TestRunner {
    init_tracing();
    let mut config = RunnerConfig::default();
    config.session.response_timeout_ms = 300;
    TestRunner::with_connector(config, connector())
}

/// Start a backend task and return the client end of its transport
pub fn spawn_backend() -> ChannelTransport {
    let (client, server) = channel_pair();
    tokio::spawn(serve(server));
    client
}

async fn serve(mut transport: ChannelTransport) {
    let greeting = json!({
        "request_state": {"type": "OK", "msg": NEW_SESSION_MSG},
        "session_uuid": Uuid::new_v4().to_string(),
    });
    if transport.send_text(greeting.to_string()).await.is_err() {
        return;
    }

    let mut backend = Backend::default();
    while let Ok(Some(text)) = transport.recv_text().await {
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        for reply in backend.handle(&request) {
            if transport.send_text(reply.to_string()).await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct Backend {
    user: Option<String>,
    next_connection_id: i64,
    connections: BTreeMap<i64, String>,
    module_sessions: HashSet<String>,
}

fn reply(request_id: &Value, kind: &str, msg: &str) -> Value {
    json!({
        "request_id": request_id,
        "request_state": {"type": kind, "msg": msg},
    })
}

fn with(mut response: Value, key: &str, value: Value) -> Value {
    response[key] = value;
    response
}

fn new_module_session_id() -> String {
    Uuid::now_v1(&[1, 2, 3, 4, 5, 6]).to_string()
}

impl Backend {
    fn handle(&mut self, request: &Value) -> Vec<Value> {
        let id = request.get("request_id").cloned().unwrap_or(Value::Null);
        match request.get("request").and_then(Value::as_str) {
            Some("authenticate") => vec![self.authenticate(&id, request)],
            Some("logout") => match self.user.take() {
                Some(_) => vec![reply(&id, "OK", "User successfully logged out.")],
                None => vec![reply(&id, "ERROR", NOT_AUTHENTICATED_MSG)],
            },
            Some("execute") if self.user.is_none() => vec![reply(&id, "ERROR", NOT_AUTHENTICATED_MSG)],
            Some("execute") => match request.get("command").and_then(Value::as_str) {
                None => vec![reply(&id, "ERROR", NO_COMMAND_MSG)],
                Some(command) => {
                    let args = request.get("args").cloned().unwrap_or_else(|| json!({}));
                    self.execute(&id, command, &args)
                }
            },
            _ => vec![reply(&id, "ERROR", "Unknown request.")],
        }
    }

    fn authenticate(&mut self, id: &Value, request: &Value) -> Value {
        let username = request.get("username").and_then(Value::as_str).unwrap_or_default();
        let password = request.get("password").and_then(Value::as_str).unwrap_or_default();
        if !username.is_empty() && username == password {
            self.user = Some(username.to_string());
            with(
                reply(id, "OK", &format!("User {} was successfully authenticated.", username)),
                "active_profile",
                json!({
                    "id": 1,
                    "user_id": 1,
                    "name": "Default",
                    "description": "Default Profile",
                    "options": {},
                }),
            )
        } else {
            reply(
                id,
                "ERROR",
                "User could not be authenticated. Incorrect username or password.",
            )
        }
    }

    fn execute(&mut self, id: &Value, command: &str, args: &Value) -> Vec<Value> {
        match command {
            "gui.sqleditor.start_session" => {
                let session = self.open_module_session();
                vec![
                    with(
                        reply(id, "PENDING", "New SQL Editor session created"),
                        "result",
                        json!({"module_session_id": session}),
                    ),
                    with(reply(id, "OK", ""), "done", json!(true)),
                ]
            }
            "gui.shell.start_session" => {
                let session = self.open_module_session();
                vec![
                    with(reply(id, "PENDING", ""), "result", json!({"module_session_id": session})),
                    reply(id, "OK", "New Shell Interactive session created successfully."),
                ]
            }
            "gui.db.start_session" => {
                let Some(kind) = args
                    .get("connection")
                    .and_then(Value::as_i64)
                    .and_then(|c| self.connections.get(&c).cloned())
                else {
                    return vec![reply(id, "ERROR", "The given connection does not exist.")];
                };
                let session = self.open_module_session();
                vec![
                    with(
                        reply(id, "PENDING", "Connection was successfully opened."),
                        "result",
                        json!({
                            "module_session_id": session,
                            "info": server_info(&kind),
                            "default_schema": default_schema(&kind),
                        }),
                    ),
                    with(reply(id, "OK", ""), "done", json!(true)),
                ]
            }
            "gui.sqleditor.close_session" | "gui.shell.close_session" | "gui.db.close_session" => {
                let session = args.get("module_session_id").and_then(Value::as_str).unwrap_or_default();
                if self.module_sessions.remove(session) {
                    vec![with(reply(id, "OK", ""), "done", json!(true))]
                } else {
                    vec![reply(id, "ERROR", "There is no module session with the given id.")]
                }
            }
            "gui.sqleditor.open_connection" => {
                let session = args.get("module_session_id").and_then(Value::as_str).unwrap_or_default();
                if !self.module_sessions.contains(session) {
                    return vec![reply(id, "ERROR", "There is no module session with the given id.")];
                }
                let Some(kind) = args
                    .get("db_connection_id")
                    .and_then(Value::as_i64)
                    .and_then(|c| self.connections.get(&c).cloned())
                else {
                    return vec![reply(id, "ERROR", "The given connection does not exist.")];
                };
                let mut response = reply(id, "OK", "Connection was successfully opened.");
                response["module_session_id"] = json!(session);
                response["info"] = server_info(&kind);
                response["default_schema"] = json!(default_schema(&kind));
                vec![response]
            }
            "gui.dbconnections.add_db_connection" => {
                let kind = args
                    .pointer("/connection/db_type")
                    .and_then(Value::as_str)
                    .unwrap_or("MySQL")
                    .to_string();
                self.next_connection_id += 1;
                self.connections.insert(self.next_connection_id, kind);
                vec![with(
                    reply(id, "OK", ""),
                    "result",
                    json!({"db_connection_id": self.next_connection_id}),
                )]
            }
            "gui.dbconnections.remove_db_connection" => {
                let removed = args
                    .get("connection_id")
                    .and_then(Value::as_i64)
                    .and_then(|c| self.connections.remove(&c));
                match removed {
                    Some(_) => vec![reply(id, "OK", "")],
                    None => vec![reply(id, "ERROR", "The given connection does not exist.")],
                }
            }
            "test.echo" => vec![with(reply(id, "OK", ""), "result", args.clone())],
            "test.stream" => vec![
                with(reply(id, "PENDING", "Executing..."), "result", json!({"row": 1})),
                with(reply(id, "PENDING", "Executing..."), "result", json!({"row": 2})),
                with(reply(id, "OK", ""), "done", json!(true)),
            ],
            "test.shuffled" => vec![
                with(reply(id, "PENDING", "Executing..."), "result", json!({"row": 2})),
                with(reply(id, "PENDING", "Executing..."), "result", json!({"row": 1})),
                with(reply(id, "OK", ""), "done", json!(true)),
            ],
            "test.silent" => Vec::new(),
            "test.delayed_stale" => vec![reply(id, "OK", "first"), reply(id, "OK", "second")],
            _ => {
                let mut response = reply(id, "ERROR", UNSUPPORTED_MSG);
                response["request_state"]["source"] = json!("MSG");
                response["request_state"]["code"] = json!(1500);
                vec![response]
            }
        }
    }

    fn open_module_session(&mut self) -> String {
        let session = new_module_session_id();
        self.module_sessions.insert(session.clone());
        session
    }
}

fn server_info(kind: &str) -> Value {
    if kind == "Sqlite" {
        json!({"version": "3.39.2"})
    } else {
        json!({"version": "8.0.33", "edition": "MySQL Community Server - GPL", "sql_mode": ""})
    }
}

fn default_schema(kind: &str) -> &'static str {
    if kind == "Sqlite" {
        "main"
    } else {
        "information_schema"
    }
}

/// Give the backend task a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
