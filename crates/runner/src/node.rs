//! Script nodes: named, parameterized units of test logic
//!
//! A node's body is resolved when the node is registered, so an unknown
//! body can never be discovered mid-scenario. Every invocation gets its own
//! [`CallFrame`]: parameters flow down, results flow back up.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::engine::Context;
use crate::error::{RunnerError, RunnerResult};

/// Parameter and result mappings
pub type Params = Map<String, Value>;

/// Executable logic behind a script node
#[async_trait::async_trait]
pub trait ScriptBody: Send + Sync {
    /// Run the body against the given invocation frame
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()>;

    /// Nodes this body may execute, checked before a scenario starts
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

/// How often a node runs between engine resets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Always,
    /// Setup nodes: later invocations return the first run's result
    Once,
    /// Like `Once`, but the marker and result survive engine resets, so the
    /// node runs once per suite
    OncePerSuite,
}

/// A registered node, owned by the namespace
pub struct ScriptNode {
    qualified_name: String,
    locator: String,
    body: Arc<dyn ScriptBody>,
    pre: Option<Arc<dyn ScriptBody>>,
    post: Option<Arc<dyn ScriptBody>>,
    params: Params,
    result: Params,
    mode: RunMode,
}

impl ScriptNode {
    pub(crate) fn new(qualified_name: String, locator: String, body: Arc<dyn ScriptBody>) -> Self {
        Self {
            qualified_name,
            locator,
            body,
            pre: None,
            post: None,
            params: Params::new(),
            result: Params::new(),
            mode: RunMode::Always,
        }
    }

    /// Dotted path from the namespace root
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Stable identifier of the body, e.g. `__lib/login/_admin`
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn body(&self) -> Arc<dyn ScriptBody> {
        Arc::clone(&self.body)
    }

    /// Hook run before the body, sharing its call frame
    pub fn pre(&self) -> Option<Arc<dyn ScriptBody>> {
        self.pre.clone()
    }

    pub fn set_pre(&mut self, hook: Arc<dyn ScriptBody>) -> &mut Self {
        self.pre = Some(hook);
        self
    }

    /// Hook run after a successful body, sharing its call frame
    pub fn post(&self) -> Option<Arc<dyn ScriptBody>> {
        self.post.clone()
    }

    pub fn set_post(&mut self, hook: Arc<dyn ScriptBody>) -> &mut Self {
        self.post = Some(hook);
        self
    }

    /// Nodes the body and its hooks may execute
    pub fn dependencies(&self) -> Vec<String> {
        let mut dependencies = self.body.dependencies();
        for hook in self.pre.iter().chain(self.post.iter()) {
            dependencies.extend(hook.dependencies());
        }
        dependencies
    }

    /// Parameters staged by callers for the next invocation
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Result of the last completed invocation
    pub fn result(&self) -> &Params {
        &self.result
    }

    pub(crate) fn set_result(&mut self, result: Params) {
        self.result = result;
    }

    pub(crate) fn clear(&mut self) {
        self.params.clear();
        if self.mode != RunMode::OncePerSuite {
            self.result.clear();
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RunMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub(crate) fn to_value(&self) -> Value {
        serde_json::json!({
            "qualified_name": self.qualified_name,
            "locator": self.locator,
            "params": self.params,
            "result": self.result,
        })
    }
}

impl fmt::Debug for ScriptNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptNode")
            .field("qualified_name", &self.qualified_name)
            .field("locator", &self.locator)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("mode", &self.mode)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

/// Per-invocation record
#[derive(Debug, Clone)]
pub struct CallFrame {
    node: String,
    params: Params,
    result: Params,
}

impl CallFrame {
    pub fn new(node: impl Into<String>, params: Params) -> Self {
        Self {
            node: node.into(),
            params,
            result: Params::new(),
        }
    }

    /// Qualified name of the node being run
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> RunnerResult<&Value> {
        self.params
            .get(name)
            .ok_or_else(|| RunnerError::UndefinedToken(format!("{}.params.{}", self.node, name)))
    }

    pub fn param_str(&self, name: &str) -> RunnerResult<&str> {
        self.param(name)?.as_str().ok_or_else(|| {
            RunnerError::ScriptFailed(format!("parameter '{}' of {} must be a string", name, self.node))
        })
    }

    pub fn param_or(&self, name: &str, default: Value) -> Value {
        self.params.get(name).cloned().unwrap_or(default)
    }

    pub fn set_result(&mut self, name: impl Into<String>, value: Value) {
        self.result.insert(name.into(), value);
    }

    pub fn result(&self) -> &Params {
        &self.result
    }

    pub fn into_result(self) -> Params {
        self.result
    }
}

/// Build a parameter map from key/value pairs
pub fn params<I, K>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
