//! wsstory scenario runner
//!
//! Drives a stateful JSON request/response backend through scripted
//! scenarios and checks every response against structural templates.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TestRunner (suite)                       │
//! │    ├── run_scenarios([Scenario]) -> TestSuiteResult         │
//! │    └── reset + reconnect between scenarios                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engine                                                     │
//! │    ├── Namespace   lib.*, defaults, responses, run tokens   │
//! │    ├── Session     request ids, last response, module id    │
//! │    └── run(Scenario) -> ScenarioReport                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Context (per scenario)                                     │
//! │    ├── execute(node, params) -> result                      │
//! │    ├── send_and_validate(request, [template])               │
//! │    └── validate_last_response(template)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Matcher                                                    │
//! │    literal | $ignore | $regex | $unordered | $literal       │
//! │    $last_request_id | $last_module_session_id               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod library;
pub mod matcher;
pub mod namespace;
pub mod node;
pub mod runner;
pub mod session;
pub mod spec;
pub mod template;

pub use config::{ConnectionFixture, RunnerConfig, TransportKind};
pub use engine::{Context, Engine, Failure, RunState, Scenario, ScenarioReport};
pub use error::{RunnerError, RunnerResult};
pub use matcher::{matches, Expect, MatchEnv, Mismatch, MismatchKind};
pub use namespace::Namespace;
pub use node::{params, CallFrame, Params, RunMode, ScriptBody, ScriptNode};
pub use runner::{TestResult, TestRunner, TestSuiteResult};
pub use session::{Session, SessionOptions};
pub use spec::{ScenarioSpec, ScriptSteps, Step};
