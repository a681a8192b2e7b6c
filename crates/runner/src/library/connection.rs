//! `lib.connection`: stored database connections

use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ConnectionFixture;
use crate::engine::{Context, TEMP_DIR_POSIX_TOKEN};
use crate::error::RunnerResult;
use crate::namespace::Namespace;
use crate::node::{params, CallFrame, ScriptBody};
use crate::template::regex;

use super::{execute_request, ok, register_component};

/// Profile connections are stored under unless `params.profile_id` says otherwise
pub const DEFAULT_PROFILE_ID: i64 = 1;

pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    register_component(
        namespace,
        "connection",
        vec![
            ("add", Arc::new(Add) as Arc<dyn ScriptBody>),
            ("add_mysql_root", Arc::new(AddMysql::ROOT)),
            ("add_mysql_user1", Arc::new(AddMysql::account("user1"))),
            ("add_mysql_user2", Arc::new(AddMysql::account("user2"))),
            ("add_mysqlx", Arc::new(AddMysql::X_PROTOCOL)),
            ("add_sqlite", Arc::new(AddSqlite)),
            ("remove", Arc::new(Remove)),
        ],
    )
}

/// Store `params.connection`; result: `connection_id`
pub struct Add;

#[async_trait::async_trait]
impl ScriptBody for Add {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let args = json!({
            "profile_id": frame.param_or("profile_id", json!(DEFAULT_PROFILE_ID)),
            "connection": frame.param("connection")?.clone(),
            "folder_path": frame.param_or("folder_path", json!("")),
        });

        let mut expected = ok(crate::template::ignore());
        expected["result"] = json!({"db_connection_id": regex("^\\d+$")});

        let responses = cx
            .send_and_validate(
                frame,
                execute_request("gui.dbconnections.add_db_connection", args),
                vec![expected],
            )
            .await?;

        let id = responses
            .first()
            .and_then(|r| r.pointer("/result/db_connection_id"))
            .cloned()
            .unwrap_or(Value::Null);
        frame.set_result("connection_id", id);
        Ok(())
    }
}

/// X protocol port used when the fixture has no `portX`
pub const DEFAULT_MYSQLX_PORT: u16 = 33060;

/// Add a MySQL connection built from `defaults.database_connections.mysql`.
///
/// `params.user` and `params.password` override the account, `params.schema`
/// sets the default schema. Result: `connection_id`.
pub struct AddMysql {
    /// Account used instead of the fixture's; its password defaults to the name
    account: Option<&'static str>,
    /// Connect with the `mysqlx` scheme on the fixture's `portX`
    x_protocol: bool,
}

impl AddMysql {
    pub const ROOT: AddMysql = AddMysql {
        account: None,
        x_protocol: false,
    };

    pub const X_PROTOCOL: AddMysql = AddMysql {
        account: None,
        x_protocol: true,
    };

    pub const fn account(name: &'static str) -> Self {
        Self {
            account: Some(name),
            x_protocol: false,
        }
    }

    fn options(&self, fixture: &ConnectionFixture, frame: &CallFrame) -> Value {
        let (scheme, port) = if self.x_protocol {
            let port = fixture
                .extra
                .get("portX")
                .cloned()
                .unwrap_or_else(|| json!(DEFAULT_MYSQLX_PORT));
            (json!("mysqlx"), port)
        } else {
            (json!(fixture.scheme), json!(fixture.port))
        };
        let (user, password) = match self.account {
            Some(name) => (json!(name), json!(name)),
            None => (json!(fixture.user), json!(fixture.password)),
        };

        let mut options = json!({
            "host": fixture.host,
            "port": port,
            "user": frame.param_or("user", user),
            "password": frame.param_or("password", password),
            "scheme": scheme,
        });
        if let Some(socket) = &fixture.socket {
            options["socket"] = json!(socket);
        }
        if let Some(schema) = frame.params().get("schema") {
            options["schema"] = schema.clone();
        }
        options
    }
}

#[async_trait::async_trait]
impl ScriptBody for AddMysql {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let fixture: ConnectionFixture = cx.namespace().fixture("defaults.database_connections.mysql")?;
        let connection = json!({
            "db_type": "MySQL",
            "caption": frame.param_or("caption", json!("This is a test MySQL database")),
            "description": "MySQL connection added by wsstory",
            "options": self.options(&fixture, frame),
        });
        let result = cx
            .execute(
                "lib.connection.add",
                params([
                    ("connection", connection),
                    ("profile_id", frame.param_or("profile_id", json!(DEFAULT_PROFILE_ID))),
                ]),
            )
            .await?;
        frame.set_result("connection_id", result.get("connection_id").cloned().unwrap_or(Value::Null));
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["lib.connection.add".to_string()]
    }
}

/// Add an SQLite connection; the database file defaults to one inside the
/// engine's temporary directory
pub struct AddSqlite;

#[async_trait::async_trait]
impl ScriptBody for AddSqlite {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let db_file = match frame.params().get("db_file") {
            Some(file) => file.clone(),
            None => {
                let fixture: Option<ConnectionFixture> =
                    cx.namespace().fixture("defaults.database_connections.sqlite").ok();
                match fixture.and_then(|f| f.extra.get("db_file").cloned()) {
                    Some(file) => file,
                    None => {
                        let dir = cx.token(TEMP_DIR_POSIX_TOKEN)?;
                        json!(format!("{}/tests.sqlite3", dir.as_str().unwrap_or(".")))
                    }
                }
            }
        };

        let connection = json!({
            "db_type": "Sqlite",
            "caption": frame.param_or("caption", json!("This is a test SQLite database")),
            "description": "SQLite connection added by wsstory",
            "options": {"db_file": db_file},
        });
        let result = cx
            .execute(
                "lib.connection.add",
                params([
                    ("connection", connection),
                    ("profile_id", frame.param_or("profile_id", json!(DEFAULT_PROFILE_ID))),
                ]),
            )
            .await?;
        frame.set_result("connection_id", result.get("connection_id").cloned().unwrap_or(Value::Null));
        frame.set_result("db_file", db_file);
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["lib.connection.add".to_string()]
    }
}

/// Remove the stored connection `params.connection_id`
pub struct Remove;

#[async_trait::async_trait]
impl ScriptBody for Remove {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let args = json!({
            "profile_id": frame.param_or("profile_id", json!(DEFAULT_PROFILE_ID)),
            "connection_id": frame.param("connection_id")?.clone(),
        });
        cx.send_and_validate(
            frame,
            execute_request("gui.dbconnections.remove_db_connection", args),
            vec![ok(crate::template::ignore())],
        )
        .await?;
        Ok(())
    }
}
