//! Orchestration engine
//!
//! Runs one scenario at a time over an owned namespace and session:
//!
//! ```text
//!   Idle ──run()──> Running ──> Completed
//!    ^                     └──> Failed
//!    └──────── reset() ─────────┘
//! ```
//!
//! Script bodies receive a [`Context`] through which they reach the
//! namespace, the session and nested node execution.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use wsstory_common::Connector;

use crate::error::{RunnerError, RunnerResult};
use crate::matcher::Expect;
use crate::namespace::Namespace;
use crate::node::{CallFrame, Params, RunMode, ScriptBody};
use crate::session::Session;
use crate::template;

/// Native path of the engine's temporary directory
pub const TEMP_DIR_TOKEN: &str = "test_temp_dir";

/// Same directory with forward slashes
pub const TEMP_DIR_POSIX_TOKEN: &str = "test_temp_dir_posix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Execution bookkeeping for the current scenario
#[derive(Debug, Default)]
pub struct CallTrace {
    stack: Vec<String>,
    failed_at: Option<Vec<String>>,
    completed_once: HashSet<String>,
    completed_per_suite: HashSet<String>,
}

impl CallTrace {
    /// Qualified names of the nodes currently executing, outermost first
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    fn record_failure(&mut self) {
        if self.failed_at.is_none() {
            self.failed_at = Some(self.stack.clone());
        }
    }

    fn has_completed(&self, node: &str, mode: RunMode) -> bool {
        match mode {
            RunMode::Always => false,
            RunMode::Once => self.completed_once.contains(node),
            RunMode::OncePerSuite => self.completed_per_suite.contains(node),
        }
    }

    fn mark_completed(&mut self, node: &str, mode: RunMode) {
        match mode {
            RunMode::Always => {}
            RunMode::Once => {
                self.completed_once.insert(node.to_string());
            }
            RunMode::OncePerSuite => {
                self.completed_per_suite.insert(node.to_string());
            }
        }
    }

    /// Forget everything except the per-suite markers
    fn reset(&mut self) {
        *self = CallTrace {
            completed_per_suite: std::mem::take(&mut self.completed_per_suite),
            ..CallTrace::default()
        };
    }
}

/// What a script body sees while it runs
pub struct Context<'a> {
    namespace: &'a mut Namespace,
    session: &'a mut Session,
    trace: &'a mut CallTrace,
}

impl<'a> Context<'a> {
    pub fn namespace(&self) -> &Namespace {
        self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        self.namespace
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    pub fn call_stack(&self) -> &[String] {
        self.trace.stack()
    }

    pub fn token(&self, path: &str) -> RunnerResult<Value> {
        self.namespace.get(path)
    }

    pub fn set_token(&mut self, path: &str, value: Value) -> RunnerResult<()> {
        self.namespace.set(path, value)
    }

    /// Run the node at `target` (qualified name or locator).
    ///
    /// Parameters staged on the node are overlaid with `params`; the body's
    /// result is stored back on the node and returned to the caller. A
    /// `pre` hook runs before the body and a `post` hook after it, both on
    /// the same frame and each with its own call stack entry.
    pub fn execute<'s>(&'s mut self, target: &'s str, params: Params) -> BoxFuture<'s, RunnerResult<Params>> {
        Box::pin(async move {
            let (qualified_name, locator, body, pre, post, mode, mut merged) = {
                let node = self.namespace.node(target)?;
                (
                    node.qualified_name().to_string(),
                    node.locator().to_string(),
                    node.body(),
                    node.pre(),
                    node.post(),
                    node.mode(),
                    node.params().clone(),
                )
            };

            if self.trace.has_completed(&qualified_name, mode) {
                debug!("Skipping {}: already ran ({:?})", qualified_name, mode);
                return Ok(self.namespace.node(&qualified_name)?.result().clone());
            }

            merged.extend(params);
            let mut frame = CallFrame::new(qualified_name.clone(), merged);

            debug!("Executing {} ({})", qualified_name, locator);
            if let Some(hook) = pre {
                self.run_labelled(format!("{}.pre", qualified_name), hook, &mut frame)
                    .await?;
            }
            self.run_labelled(qualified_name.clone(), body, &mut frame).await?;
            if let Some(hook) = post {
                self.run_labelled(format!("{}.post", qualified_name), hook, &mut frame)
                    .await?;
            }

            let result = frame.into_result();
            self.namespace.node_mut(&qualified_name)?.set_result(result.clone());
            self.trace.mark_completed(&qualified_name, mode);
            debug!("Finished {}", qualified_name);
            Ok(result)
        })
    }

    async fn run_labelled(
        &mut self,
        label: String,
        body: Arc<dyn ScriptBody>,
        frame: &mut CallFrame,
    ) -> RunnerResult<()> {
        self.trace.stack.push(label);
        let outcome = body.run(self, frame).await;
        if outcome.is_err() {
            self.trace.record_failure();
        }
        self.trace.stack.pop();
        outcome
    }

    /// Resolve `$token` and `$param` placeholders against this invocation
    pub fn resolve(&self, frame: &CallFrame, template: &Value) -> RunnerResult<Value> {
        template::resolve(template, self.namespace, frame.params())
    }

    pub fn compile(&self, frame: &CallFrame, template: &Value) -> RunnerResult<Expect> {
        Expect::compile(&self.resolve(frame, template)?)
    }

    pub async fn send(&mut self, frame: &CallFrame, message: Value) -> RunnerResult<()> {
        let message = self.resolve(frame, &message)?;
        self.session.send(message).await
    }

    pub async fn receive(&mut self) -> RunnerResult<Value> {
        self.session.receive().await
    }

    /// Wait for the next response and validate it
    pub async fn expect_next(&mut self, frame: &CallFrame, expected: &Value) -> RunnerResult<Value> {
        let expected = self.compile(frame, expected)?;
        self.session.expect_next(&expected).await
    }

    /// Send `message` and validate one response per template, in order
    pub async fn send_and_validate(
        &mut self,
        frame: &CallFrame,
        message: Value,
        expected: Vec<Value>,
    ) -> RunnerResult<Vec<Value>> {
        let message = self.resolve(frame, &message)?;
        let expected = expected
            .iter()
            .map(|t| self.compile(frame, t))
            .collect::<RunnerResult<Vec<_>>>()?;
        self.session.send_and_validate(message, &expected).await
    }

    pub fn validate_last_response(&self, frame: &CallFrame, expected: &Value) -> RunnerResult<Value> {
        let expected = self.compile(frame, expected)?;
        self.session.validate_last_response(&expected).cloned()
    }
}

/// A runnable scenario: a name plus an entry body
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    entry: Arc<dyn ScriptBody>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, entry: impl ScriptBody + 'static) -> Self {
        Self::from_arc(name, Arc::new(entry))
    }

    pub fn from_arc(name: impl Into<String>, entry: Arc<dyn ScriptBody>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            entry,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Everything known about a failed scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// Path of the first structural difference, e.g. `$.request_state.msg`
    pub path: Option<String>,
    pub diff: Option<String>,
    pub call_stack: Vec<String>,
    pub last_request: Option<Value>,
    pub last_response: Option<Value>,
}

impl Failure {
    fn new(error: &RunnerError, call_stack: Vec<String>, session: Option<&Session>) -> Self {
        let mismatch = error.mismatch();
        Self {
            message: error.to_string(),
            path: mismatch.map(|m| m.path()),
            diff: mismatch.map(|m| m.to_string()),
            call_stack,
            last_request: session.and_then(|s| s.last_request().cloned()),
            last_response: session.and_then(|s| s.last_response().cloned()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub state: RunState,
    pub duration_ms: u64,
    pub failure: Option<Failure>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.state == RunState::Completed
    }
}

pub struct Engine {
    namespace: Namespace,
    session: Session,
    trace: CallTrace,
    state: RunState,
    temp_dir: TempDir,
}

impl Engine {
    pub fn new(namespace: Namespace, session: Session) -> RunnerResult<Self> {
        let temp_dir = tempfile::Builder::new().prefix("wsstory-").tempdir()?;
        let mut engine = Self {
            namespace,
            session,
            trace: CallTrace::default(),
            state: RunState::Idle,
            temp_dir,
        };
        engine.install_temp_dir_tokens()?;
        Ok(engine)
    }

    fn install_temp_dir_tokens(&mut self) -> RunnerResult<()> {
        let native = self.temp_dir.path().to_string_lossy().to_string();
        let posix = native.replace('\\', "/");
        self.namespace.set(TEMP_DIR_TOKEN, Value::String(native))?;
        self.namespace.set(TEMP_DIR_POSIX_TOKEN, Value::String(posix))?;
        self.namespace.protect(TEMP_DIR_TOKEN)?;
        self.namespace.protect(TEMP_DIR_POSIX_TOKEN)?;
        Ok(())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn temp_dir(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    pub fn context(&mut self) -> Context<'_> {
        Context {
            namespace: &mut self.namespace,
            session: &mut self.session,
            trace: &mut self.trace,
        }
    }

    /// Execute a single node outside of a scenario run
    pub async fn execute(&mut self, target: &str, params: Params) -> RunnerResult<Params> {
        let mut cx = self.context();
        cx.execute(target, params).await
    }

    /// Verify every registered node's declared dependencies resolve
    pub fn check_registry(&self) -> RunnerResult<()> {
        for node in self.namespace.nodes() {
            for dependency in node.dependencies() {
                self.namespace.node(&dependency)?;
            }
        }
        Ok(())
    }

    /// Verify every node reachable from the scenario's entry is registered
    pub fn check(&self, scenario: &Scenario) -> RunnerResult<()> {
        let mut pending = scenario.entry.dependencies();
        let mut seen = HashSet::new();
        while let Some(target) = pending.pop() {
            let node = self.namespace.node(&target)?;
            if seen.insert(node.qualified_name().to_string()) {
                pending.extend(node.dependencies());
            }
        }
        Ok(())
    }

    /// Run a scenario to completion or first failure
    pub async fn run(&mut self, scenario: &Scenario) -> ScenarioReport {
        if self.state != RunState::Idle {
            warn!("Refusing to run {}: engine is {:?}", scenario.name, self.state);
            return ScenarioReport {
                name: scenario.name.clone(),
                state: RunState::Failed,
                duration_ms: 0,
                failure: Some(Failure::new(&RunnerError::NotReset, Vec::new(), None)),
            };
        }

        info!("-----=== [START] {} ===-----", scenario.name);
        let start = Instant::now();
        self.state = RunState::Running;

        let outcome = match self.check(scenario) {
            Ok(()) => self.run_entry(scenario).await,
            Err(e) => Err(e),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.state = RunState::Completed;
                info!("-----=== [END] {} PASS ({} ms) ===-----", scenario.name, duration_ms);
                ScenarioReport {
                    name: scenario.name.clone(),
                    state: RunState::Completed,
                    duration_ms,
                    failure: None,
                }
            }
            Err(e) => {
                self.state = RunState::Failed;
                let call_stack = self.trace.failed_at.take().unwrap_or_default();
                let failure = Failure::new(&e, call_stack, Some(&self.session));
                error!("{} failed: {}", scenario.name, e);
                if !failure.call_stack.is_empty() {
                    error!("  call stack: {}", failure.call_stack.join(" > "));
                }
                info!("-----=== [END] {} FAIL ({} ms) ===-----", scenario.name, duration_ms);
                ScenarioReport {
                    name: scenario.name.clone(),
                    state: RunState::Failed,
                    duration_ms,
                    failure: Some(failure),
                }
            }
        }
    }

    async fn run_entry(&mut self, scenario: &Scenario) -> RunnerResult<()> {
        let body = Arc::clone(&scenario.entry);
        let mut frame = CallFrame::new(scenario.name.clone(), Params::new());
        self.trace.stack.push(scenario.name.clone());

        let mut cx = self.context();
        let outcome = body.run(&mut cx, &mut frame).await;

        if outcome.is_err() {
            self.trace.record_failure();
        }
        self.trace.stack.pop();
        outcome
    }

    /// Clear run variables, node state and once-markers; back to `Idle`.
    /// Nodes run with [`RunMode::OncePerSuite`] keep their marker and result.
    pub fn reset_state(&mut self) -> RunnerResult<()> {
        self.namespace.reset_run_tokens();
        self.trace.reset();
        self.install_temp_dir_tokens()?;
        self.state = RunState::Idle;
        Ok(())
    }

    /// Full reset between independent scenarios, including a fresh connection
    pub async fn reset(&mut self, connector: &dyn Connector) -> RunnerResult<()> {
        self.reset_state()?;
        self.session.reconnect(connector).await?;
        debug!("Engine reset");
        Ok(())
    }
}
