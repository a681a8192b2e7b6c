//! Built-in script library, registered under `lib`
//!
//! | component   | nodes                                                     |
//! |-------------|-----------------------------------------------------------|
//! | (`lib`)     | `noop`, `init_mysql`, `init_mysql_x`, `init_sqlite`       |
//! | `login`     | `login`, `admin`, `logout`                                |
//! | `connection`| `add`, `add_mysql_root`, `add_mysql_user1`,               |
//! |             | `add_mysql_user2`, `add_mysqlx`, `add_sqlite`, `remove`   |
//! | `sqleditor` | `open_session`, `close_session`, `open_connection`,       |
//! |             | `open_connection_validate_{mysql,mysqlx,sqlite}`,         |
//! |             | `create_test_sessions`                                    |
//! | `shell`     | `open_session`, `close_session`                           |
//! | `dbsession` | `open_db_session`, `close_db_session`                     |
//!
//! The `init_*` nodes run once per suite. Scenario nodes are grouped under
//! the root components `unit`, `regression` and `user_stories`.

pub mod connection;
pub mod dbsession;
pub mod login;
pub mod shell;
pub mod sqleditor;

use serde_json::{json, Value};
use std::sync::Arc;
use wsstory_common::protocol::{NOT_AUTHENTICATED_MSG, NO_COMMAND_MSG};

use crate::engine::Context;
use crate::error::RunnerResult;
use crate::namespace::{Namespace, LIB};
use crate::node::{CallFrame, RunMode, ScriptBody};
use crate::template::{generate_request_id, ignore, last_module_session_id, last_request_id, regex};

/// Module session ids are version 1 UUIDs
pub const UUID_V1_PATTERN: &str = "[a-f0-9]{8}-[a-f0-9]{4}-1[a-f0-9]{3}-[89ab][a-f0-9]{3}-[a-f0-9]{12}";

/// Token path of the canned response templates
pub const RESPONSES: &str = "responses";

/// Token path of the canned request templates
pub const REQUESTS: &str = "requests";

/// Root components holding scenario nodes
pub const ROOT_COMPONENTS: [&str; 3] = ["unit", "regression", "user_stories"];

/// Suite setup nodes and the library node each one runs
const INIT_NODES: [(&str, &str); 3] = [
    ("init_mysql", "lib.connection.add_mysql_root"),
    ("init_mysql_x", "lib.connection.add_mysqlx"),
    ("init_sqlite", "lib.connection.add_sqlite"),
];

/// Register the root components and every built-in node
pub fn register(namespace: &mut Namespace) -> RunnerResult<()> {
    for name in ROOT_COMPONENTS {
        namespace.register_component("", name)?;
    }
    login::register(namespace)?;
    connection::register(namespace)?;
    sqleditor::register(namespace)?;
    shell::register(namespace)?;
    dbsession::register(namespace)?;

    namespace.register_item(LIB, "noop", Arc::new(Noop))?;
    for (name, target) in INIT_NODES {
        namespace
            .register_item(LIB, name, Arc::new(Delegate(target)))?
            .set_mode(RunMode::OncePerSuite);
    }
    Ok(())
}

/// Does nothing; a placeholder step
pub struct Noop;

#[async_trait::async_trait]
impl ScriptBody for Noop {
    async fn run(&self, _cx: &mut Context<'_>, _frame: &mut CallFrame) -> RunnerResult<()> {
        Ok(())
    }
}

/// Run another node with this node's params and adopt its result
pub struct Delegate(pub &'static str);

#[async_trait::async_trait]
impl ScriptBody for Delegate {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        let result = cx.execute(self.0, frame.params().clone()).await?;
        for (key, value) in result {
            frame.set_result(key, value);
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.0.to_string()]
    }
}

pub(crate) fn register_component(
    namespace: &mut Namespace,
    name: &str,
    nodes: Vec<(&str, Arc<dyn ScriptBody>)>,
) -> RunnerResult<()> {
    namespace.register_component(LIB, name)?;
    let component = format!("{}.{}", LIB, name);
    for (item, body) in nodes {
        namespace.register_item(&component, item, body)?;
    }
    Ok(())
}

/// An `execute` request with a fresh request id
pub fn execute_request(command: &str, args: Value) -> Value {
    json!({
        "request": "execute",
        "request_id": generate_request_id(),
        "command": command,
        "args": args,
    })
}

fn state(kind: &str, msg: Value) -> Value {
    json!({
        "request_id": last_request_id(),
        "request_state": {"type": kind, "msg": msg},
    })
}

pub fn ok(msg: Value) -> Value {
    state("OK", msg)
}

pub fn pending(msg: Value) -> Value {
    state("PENDING", msg)
}

/// Final `OK` response of a multi-message exchange
pub fn done(msg: Value) -> Value {
    let mut template = ok(msg);
    template["done"] = Value::Bool(true);
    template
}

pub fn error(msg: Value) -> Value {
    state("ERROR", msg)
}

/// Template for a freshly announced module session id
pub fn module_session_id() -> Value {
    regex(UUID_V1_PATTERN)
}

/// Request templates installed at `requests`; fill in `args` before sending
pub fn canned_requests() -> Value {
    json!({
        "sqleditor": {
            "execute": execute_request(
                "gui.sqleditor.execute",
                json!({"sql": "", "module_session_id": last_module_session_id(), "params": []}),
            ),
        },
        "shell": {
            "execute": execute_request(
                "gui.shell.execute",
                json!({"command": "", "module_session_id": last_module_session_id()}),
            ),
        },
    })
}

/// Canned response templates installed at `responses`
pub fn canned_responses() -> Value {
    let mut sql_zero_rows = ok(json!("Full result set consisting of 0 rows transferred."));
    sql_zero_rows["rows"] = ignore();
    sql_zero_rows["total_row_count"] = json!(0);
    sql_zero_rows["execution_time"] = ignore();

    let mut one_row = ok(json!("Full result set consisting of 1 row transferred."));
    one_row["rows"] = ignore();
    one_row["total_row_count"] = json!(1);
    one_row["execution_time"] = ignore();

    let mut executing = pending(json!("Executing..."));
    executing["result"] = json!({});

    let mut canceled = pending(json!("Executing..."));
    canceled["result"] = json!({"error": "Cancelled\n"});

    let mut error_default = error(ignore());
    error_default["request_state"]["source"] = json!("MSG");
    error_default["request_state"]["code"] = ignore();

    let mut not_supported = error(json!("The requested command is not supported."));
    not_supported["request_state"]["source"] = json!("MSG");
    not_supported["request_state"]["code"] = json!(1500);

    json!({
        "ok": {
            "default": ok(ignore()),
            "done": done(ignore()),
            "sql_zero_rows": sql_zero_rows,
            "one_row_transferred": one_row,
        },
        "pending": {
            "execution_started": pending(json!("Execution started...")),
            "executing": executing,
            "canceled": canceled,
        },
        "error": {
            "default": error_default,
            "command_not_supported": not_supported,
            "not_authenticated": error(json!(NOT_AUTHENTICATED_MSG)),
            "no_command": error(json!(NO_COMMAND_MSG)),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{matches, Expect, MatchEnv};

    #[test]
    fn test_register_all() {
        let mut ns = Namespace::new();
        register(&mut ns).unwrap();
        for locator in [
            "__lib/login/_admin",
            "__lib/connection/_add_mysql_root",
            "__lib/sqleditor/_open_connection_validate_sqlite",
            "__lib/shell/_close_session",
            "__lib/dbsession/_open_db_session",
            "__lib/_noop",
            "__lib/_init_sqlite",
            "__lib/connection/_add_mysql_user2",
            "__lib/connection/_add_mysqlx",
            "__lib/sqleditor/_create_test_sessions",
            "__lib/sqleditor/_open_connection_validate_mysqlx",
        ] {
            assert!(ns.node(locator).is_ok(), "{locator} not registered");
        }
        assert!(register(&mut ns).is_err());
    }

    #[test]
    fn test_root_components_registered() {
        let mut ns = Namespace::new();
        register(&mut ns).unwrap();
        for name in ROOT_COMPONENTS {
            assert_eq!(ns.get(name).unwrap()["name"], json!(name));
        }
    }

    #[test]
    fn test_init_nodes_run_once_per_suite() {
        let mut ns = Namespace::new();
        register(&mut ns).unwrap();
        for (name, target) in INIT_NODES {
            let node = ns.node(&format!("lib.{}", name)).unwrap();
            assert_eq!(node.mode(), RunMode::OncePerSuite);
            assert_eq!(node.dependencies(), vec![target.to_string()]);
        }
        assert_eq!(ns.node("lib.noop").unwrap().mode(), RunMode::Always);
    }

    #[test]
    fn test_canned_requests_use_session_markers() {
        let requests = canned_requests();
        let sql = &requests["sqleditor"]["execute"];
        assert_eq!(sql["command"], json!("gui.sqleditor.execute"));
        assert_eq!(sql["request_id"], generate_request_id());
        assert_eq!(sql["args"]["module_session_id"], last_module_session_id());
        assert_eq!(sql["args"]["params"], json!([]));

        let shell = &requests["shell"]["execute"];
        assert_eq!(shell["command"], json!("gui.shell.execute"));
        assert_eq!(shell["args"]["command"], json!(""));
    }

    #[test]
    fn test_every_dependency_is_registered() {
        let mut ns = Namespace::new();
        register(&mut ns).unwrap();
        for node in ns.nodes() {
            for dependency in node.dependencies() {
                assert!(ns.node(&dependency).is_ok(), "{} needs {}", node.qualified_name(), dependency);
            }
        }
    }

    #[test]
    fn test_module_session_pattern() {
        let expected = Expect::compile(&module_session_id()).unwrap();
        let env = MatchEnv::default();
        assert!(matches(&expected, &json!("0b3c1e2a-5d4f-11ee-8c99-0242ac120002"), &env).is_ok());
        assert!(matches(&expected, &json!("0b3c1e2a-5d4f-41ee-8c99-0242ac120002"), &env).is_err());
        assert!(matches(&expected, &json!("0b3c1e2a-5d4f-11ee-8c99-0242ac120002/ws"), &env).is_ok());
    }

    #[test]
    fn test_canned_ok_uses_match_time_request_id() {
        let responses = canned_responses();
        let expected = Expect::compile(&responses["ok"]["default"]).unwrap();
        let env = MatchEnv {
            last_request_id: Some("r-1"),
            ..MatchEnv::default()
        };
        let actual = json!({"request_id": "r-1", "request_state": {"type": "OK", "msg": "whatever"}});
        assert!(matches(&expected, &actual, &env).is_ok());

        let other = json!({"request_id": "r-2", "request_state": {"type": "OK", "msg": ""}});
        assert!(matches(&expected, &other, &env).is_err());
    }
}
