//! Declarative scenarios (YAML or JSON)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::{Context, Scenario};
use crate::error::{RunnerError, RunnerResult};
use crate::namespace::Namespace;
use crate::node::{CallFrame, Params, ScriptBody, ScriptNode};

/// A complete scenario parsed from YAML or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Steps to execute in order
    pub steps: Vec<Step>,

    /// Steps run before `steps`; a registered node gets them as its `pre` hook
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<Step>,

    /// Steps run after `steps`; a registered node gets them as its `post` hook
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<Step>,
}

/// A single step of a scenario or node body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Write a token; `$token`/`$param` inside `value` are resolved first
    Set { path: String, value: Value },

    /// Remove a token
    Unset { path: String },

    /// Run a script node, optionally storing its result at a token path
    Execute {
        node: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        result_into: Option<String>,
    },

    /// Transmit a message without waiting
    Send { request: Value },

    /// Wait for the next message, validating it if `expect` is given
    Receive {
        #[serde(default)]
        expect: Option<Value>,
    },

    /// Send and validate the responses in order.
    /// A single template may be given without the surrounding list.
    SendAndValidate { request: Value, expect: Value },

    /// Validate the last received response without waiting
    ValidateLastResponse { expect: Value },

    /// Copy a value out of the last response (JSON pointer) into a token
    Capture { from: String, into: String },

    /// Set a result value of the running node
    SetResult { name: String, value: Value },

    /// Log a message (for debugging)
    Log { message: String },

    /// Wait for a fixed amount of time (use sparingly)
    Sleep { ms: u64 },
}

impl ScenarioSpec {
    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> RunnerResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a scenario from a JSON string
    pub fn from_json(json: &str) -> RunnerResult<Self> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a scenario from a file, by extension
    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.name.trim().is_empty() {
            return Err(RunnerError::SpecParse("scenario name must not be empty".to_string()));
        }
        for step in self.pre.iter().chain(&self.steps).chain(&self.post) {
            if let Step::Capture { from, .. } = step {
                if !from.is_empty() && !from.starts_with('/') {
                    return Err(RunnerError::SpecParse(format!(
                        "{}: capture source '{}' must be a JSON pointer",
                        self.name, from
                    )));
                }
            }
        }
        Ok(())
    }

    /// Nodes executed directly by this scenario, hooks included
    pub fn referenced_nodes(&self) -> Vec<String> {
        [&self.pre, &self.steps, &self.post]
            .into_iter()
            .flat_map(|steps| referenced_nodes(steps))
            .collect()
    }

    /// Filter specs by tag
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// A scenario running `pre`, `steps` and `post` in sequence
    pub fn to_scenario(&self) -> Scenario {
        let steps = self
            .pre
            .iter()
            .chain(&self.steps)
            .chain(&self.post)
            .cloned()
            .collect();
        Scenario::new(self.name.clone(), ScriptSteps::new(steps))
            .with_description(self.description.clone())
            .with_tags(self.tags.clone())
    }

    /// Register the steps as a reusable node at `component.name`
    pub fn register_as<'n>(
        &self,
        namespace: &'n mut Namespace,
        component: &str,
        name: &str,
    ) -> RunnerResult<&'n mut ScriptNode> {
        let node = namespace.register_item(component, name, Arc::new(ScriptSteps::new(self.steps.clone())))?;
        if !self.pre.is_empty() {
            node.set_pre(Arc::new(ScriptSteps::new(self.pre.clone())));
        }
        if !self.post.is_empty() {
            node.set_post(Arc::new(ScriptSteps::new(self.post.clone())));
        }
        Ok(node)
    }
}

fn referenced_nodes(steps: &[Step]) -> Vec<String> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Execute { node, .. } => Some(node.clone()),
            _ => None,
        })
        .collect()
}

/// A body made of declarative steps
#[derive(Debug, Clone)]
pub struct ScriptSteps {
    steps: Vec<Step>,
}

impl ScriptSteps {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

#[async_trait::async_trait]
impl ScriptBody for ScriptSteps {
    async fn run(&self, cx: &mut Context<'_>, frame: &mut CallFrame) -> RunnerResult<()> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!("{} step {}", frame.node(), index + 1);
            run_step(cx, frame, step).await?;
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<String> {
        referenced_nodes(&self.steps)
    }
}

async fn run_step(cx: &mut Context<'_>, frame: &mut CallFrame, step: &Step) -> RunnerResult<()> {
    match step {
        Step::Set { path, value } => {
            let value = cx.resolve(frame, value)?;
            cx.set_token(path, value)?;
        }
        Step::Unset { path } => {
            cx.namespace_mut().unset(path)?;
        }
        Step::Execute { node, params, result_into } => {
            let params = match cx.resolve(frame, &Value::Object(params.clone()))? {
                Value::Object(map) => map,
                _ => Params::new(),
            };
            let result = cx.execute(node, params).await?;
            if let Some(path) = result_into {
                cx.set_token(path, Value::Object(result))?;
            }
        }
        Step::Send { request } => {
            cx.send(frame, request.clone()).await?;
        }
        Step::Receive { expect: Some(expected) } => {
            cx.expect_next(frame, expected).await?;
        }
        Step::Receive { expect: None } => {
            cx.receive().await?;
        }
        Step::SendAndValidate { request, expect } => {
            let expected = match expect {
                Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            cx.send_and_validate(frame, request.clone(), expected).await?;
        }
        Step::ValidateLastResponse { expect } => {
            cx.validate_last_response(frame, expect)?;
        }
        Step::Capture { from, into } => {
            let last = cx.session().last_response().ok_or(RunnerError::MissingResponse)?;
            let value = last
                .pointer(from)
                .cloned()
                .ok_or_else(|| RunnerError::UndefinedToken(format!("last_response{}", from)))?;
            cx.set_token(into, value)?;
        }
        Step::SetResult { name, value } => {
            let value = cx.resolve(frame, value)?;
            frame.set_result(name.clone(), value);
        }
        Step::Log { message } => info!("{}", message),
        Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_spec() {
        let yaml = r#"
name: sqleditor-session
description: Open and close an SQL editor session
tags:
  - sqleditor
  - smoke
steps:
  - action: execute
    node: lib.login.admin
  - action: send_and_validate
    request:
      request: execute
      request_id: $generate_request_id
      command: gui.sqleditor.start_session
    expect:
      - request_id: $last_request_id
        request_state: {type: PENDING, msg: New SQL Editor session created}
        module_session_id: {$regex: '^[a-f0-9-]+$'}
      - request_state: {type: OK}
        done: true
  - action: capture
    from: /module_session_id
    into: editor_session
"#;
        let spec = ScenarioSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "sqleditor-session");
        assert_eq!(spec.steps.len(), 3);
        assert_eq!(spec.referenced_nodes(), vec!["lib.login.admin"]);
        match &spec.steps[1] {
            Step::SendAndValidate { expect, .. } => assert_eq!(expect.as_array().unwrap().len(), 2),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_parse_json_spec() {
        let spec = ScenarioSpec::from_json(
            &json!({
                "name": "no-command",
                "steps": [
                    {"action": "set", "path": "profile_id", "value": 1},
                    {"action": "send_and_validate",
                     "request": {"request": "execute", "request_id": "$generate_request_id"},
                     "expect": {"request_state": {"type": "ERROR"}}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        assert!(spec.tags.is_empty());
        assert!(matches!(spec.steps[0], Step::Set { .. }));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let yaml = "name: x\nsteps:\n  - action: navigate\n    url: /\n";
        assert!(ScenarioSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_capture_requires_pointer() {
        let yaml = "name: x\nsteps:\n  - action: capture\n    from: result.id\n    into: id\n";
        assert!(matches!(ScenarioSpec::from_yaml(yaml), Err(RunnerError::SpecParse(_))));
    }

    #[test]
    fn test_hook_steps_parsed_and_registered() {
        let yaml = r#"
name: with-hooks
pre:
  - action: execute
    node: lib.login.admin
steps:
  - action: set_result
    name: done
    value: true
post:
  - action: execute
    node: lib.login.logout
"#;
        let spec = ScenarioSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.referenced_nodes(), vec!["lib.login.admin", "lib.login.logout"]);

        let mut ns = Namespace::new();
        let node = spec.register_as(&mut ns, "lib", "hooked").unwrap();
        assert!(node.pre().is_some());
        assert!(node.post().is_some());
        assert_eq!(node.dependencies(), vec!["lib.login.admin", "lib.login.logout"]);
    }

    #[test]
    fn test_filter_by_tag() {
        let specs = vec![
            ScenarioSpec::from_yaml("name: a\ntags: [smoke]\nsteps: []\n").unwrap(),
            ScenarioSpec::from_yaml("name: b\nsteps: []\n").unwrap(),
        ];
        let smoke = ScenarioSpec::filter_by_tag(&specs, "smoke");
        assert_eq!(smoke.len(), 1);
        assert_eq!(smoke[0].name, "a");
    }
}
