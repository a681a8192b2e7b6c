//! Token namespace: the tree of fixtures, script nodes and run variables
//!
//! ```text
//! tokens                       (root)
//!   ├── lib                    component, display name "__lib"
//!   │     ├── login            component "__lib/login"
//!   │     │     ├── admin      node, locator "__lib/login/_admin"
//!   │     │     └── logout     node, locator "__lib/login/_logout"
//!   │     └── ...
//!   ├── unit, regression, ...  components for scenario nodes
//!   ├── defaults               protected value (connection fixtures)
//!   ├── responses, requests    protected values (canned templates)
//!   └── connection_id          run variable, dropped on reset
//! ```
//!
//! A reset drops run variables wherever they were written and puts every
//! protected value back to what it was when protected.
//!
//! Paths are dotted. Traversal continues into node records
//! (`lib.login.admin.result.active_profile`) and into JSON values
//! (`defaults.database_connections.mysql.port`, array indices allowed).
//! Nothing is created implicitly: setting `a.b` requires `a` to exist.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};
use crate::node::{Params, ScriptBody, ScriptNode};

/// Path of the built-in library component
pub const LIB: &str = "lib";

/// Display name of the built-in library component
pub const LIB_DISPLAY_NAME: &str = "__lib";

/// Prefix distinguishing item locators from component names
pub const ITEM_MARKER: &str = "_";

pub enum Token {
    Value(Value),
    Component(Component),
    Node(ScriptNode),
}

/// Grouping node
#[derive(Default)]
pub struct Component {
    display_name: String,
    children: BTreeMap<String, Token>,
}

impl Component {
    fn new(display_name: String) -> Self {
        Self {
            display_name,
            children: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.display_name,
            "children": self.children.keys().collect::<Vec<_>>(),
        })
    }

    /// Drop values set inside this component and clear its nodes
    fn clear_run_tokens(&mut self) {
        self.children.retain(|_, token| !matches!(token, Token::Value(_)));
        for token in self.children.values_mut() {
            match token {
                Token::Node(node) => node.clear(),
                Token::Component(c) => c.clear_run_tokens(),
                Token::Value(_) => {}
            }
        }
    }

    fn collect_nodes<'a>(&'a self, out: &mut Vec<&'a ScriptNode>) {
        for token in self.children.values() {
            match token {
                Token::Node(node) => out.push(node),
                Token::Component(c) => c.collect_nodes(out),
                Token::Value(_) => {}
            }
        }
    }
}

/// The token namespace of one engine
pub struct Namespace {
    root: Component,
    locators: HashMap<String, String>,
    protected: HashMap<String, Value>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Create a namespace holding only the empty `lib` component
    pub fn new() -> Self {
        let mut root = Component::new(String::new());
        root.children.insert(
            LIB.to_string(),
            Token::Component(Component::new(LIB_DISPLAY_NAME.to_string())),
        );
        Self {
            root,
            locators: HashMap::new(),
            protected: HashMap::new(),
        }
    }

    /// Register `parent.name` as a component; `""` names the root.
    /// Returns the new component's display name.
    pub fn register_component(&mut self, parent: &str, name: &str) -> RunnerResult<String> {
        validate_name(name)?;
        let component = self
            .component_mut(parent)
            .ok_or_else(|| RunnerError::UnknownComponent(parent.to_string()))?;
        if component.children.contains_key(name) {
            return Err(RunnerError::DuplicateRegistration {
                parent: parent.to_string(),
                name: name.to_string(),
            });
        }

        let display_name = if component.display_name.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", component.display_name, name)
        };
        component
            .children
            .insert(name.to_string(), Token::Component(Component::new(display_name.clone())));
        debug!("Registered component {}", display_name);
        Ok(display_name)
    }

    /// Register `component.name` as a script node backed by `body`
    pub fn register_item(
        &mut self,
        component: &str,
        name: &str,
        body: Arc<dyn ScriptBody>,
    ) -> RunnerResult<&mut ScriptNode> {
        validate_name(name)?;
        let qualified_name = join(component, name);
        let parent = self
            .component_mut(component)
            .ok_or_else(|| RunnerError::UnknownComponent(component.to_string()))?;
        if parent.children.contains_key(name) {
            return Err(RunnerError::DuplicateRegistration {
                parent: component.to_string(),
                name: name.to_string(),
            });
        }

        let locator = if parent.display_name.is_empty() {
            format!("{}{}", ITEM_MARKER, name)
        } else {
            format!("{}/{}{}", parent.display_name, ITEM_MARKER, name)
        };
        debug!("Registered node {} ({})", qualified_name, locator);

        parent.children.insert(
            name.to_string(),
            Token::Node(ScriptNode::new(qualified_name.clone(), locator.clone(), body)),
        );
        self.locators.insert(locator, qualified_name.clone());

        match self.token_mut(&qualified_name) {
            Some(Token::Node(node)) => Ok(node),
            _ => Err(RunnerError::UnknownNode(qualified_name)),
        }
    }

    /// Read the value at `path`
    pub fn get(&self, path: &str) -> RunnerResult<Value> {
        let undefined = || RunnerError::UndefinedToken(path.to_string());
        let segments = split(path).ok_or_else(undefined)?;

        let mut component = &self.root;
        for (i, segment) in segments.iter().enumerate() {
            match component.children.get(*segment).ok_or_else(undefined)? {
                Token::Component(c) => component = c,
                Token::Node(node) => {
                    return descend(&node.to_value(), &segments[i + 1..]).ok_or_else(undefined)
                }
                Token::Value(value) => {
                    return descend(value, &segments[i + 1..]).ok_or_else(undefined)
                }
            }
        }
        Ok(component.to_value())
    }

    /// Whether `path` can be read
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Deserialize the value at `path` into a typed fixture
    pub fn fixture<T: DeserializeOwned>(&self, path: &str) -> RunnerResult<T> {
        Ok(serde_json::from_value(self.get(path)?)?)
    }

    /// Write `value` at `path`. The parent must already exist.
    pub fn set(&mut self, path: &str, value: Value) -> RunnerResult<()> {
        let segments = split(path).ok_or_else(|| RunnerError::UndefinedToken(path.to_string()))?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(RunnerError::UndefinedToken(path.to_string()));
        };

        let mut component = &mut self.root;
        for (i, segment) in parents.iter().enumerate() {
            match component.children.get_mut(*segment) {
                Some(Token::Component(c)) => component = c,
                Some(Token::Node(node)) => return set_in_node(node, &segments[i + 1..], value, path),
                Some(Token::Value(target)) => {
                    return set_in_value(target, &segments[i + 1..], value)
                        .ok_or_else(|| RunnerError::UndefinedToken(path.to_string()))
                }
                None => {
                    return Err(RunnerError::UndefinedToken(segments[..=i].join(".")));
                }
            }
        }

        match component.children.get_mut(*last) {
            Some(Token::Value(target)) => {
                *target = value;
                Ok(())
            }
            Some(_) => Err(RunnerError::TokenConflict(path.to_string())),
            None => {
                component.children.insert(last.to_string(), Token::Value(value));
                Ok(())
            }
        }
    }

    /// Remove the value at `path`, returning it
    pub fn unset(&mut self, path: &str) -> RunnerResult<Value> {
        let undefined = || RunnerError::UndefinedToken(path.to_string());
        let segments = split(path).ok_or_else(undefined)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(undefined());
        };

        let mut component = &mut self.root;
        for (i, segment) in parents.iter().enumerate() {
            match component.children.get_mut(*segment) {
                Some(Token::Component(c)) => component = c,
                Some(Token::Node(node)) => {
                    let rest = &segments[i + 1..];
                    let map = match rest.first() {
                        Some(&"params") => node.params_mut(),
                        _ => return Err(RunnerError::TokenConflict(path.to_string())),
                    };
                    return remove_in_map(map, &rest[1..]).ok_or_else(undefined);
                }
                Some(Token::Value(target)) => {
                    return remove_in_value(target, &segments[i + 1..]).ok_or_else(undefined)
                }
                None => return Err(undefined()),
            }
        }

        match component.children.get(*last) {
            Some(Token::Value(_)) => match component.children.remove(*last) {
                Some(Token::Value(value)) => Ok(value),
                _ => Err(undefined()),
            },
            Some(_) => Err(RunnerError::TokenConflict(path.to_string())),
            None => Err(undefined()),
        }
    }

    /// Look up a node by qualified name or by locator
    pub fn node(&self, target: &str) -> RunnerResult<&ScriptNode> {
        let path = self.locators.get(target).map(String::as_str).unwrap_or(target);
        match self.token(path) {
            Some(Token::Node(node)) => Ok(node),
            _ => Err(RunnerError::UnknownNode(target.to_string())),
        }
    }

    pub fn node_mut(&mut self, target: &str) -> RunnerResult<&mut ScriptNode> {
        let path = self
            .locators
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string());
        match self.token_mut(&path) {
            Some(Token::Node(node)) => Ok(node),
            _ => Err(RunnerError::UnknownNode(target.to_string())),
        }
    }

    /// Stage a parameter for the next invocation of `node`
    pub fn set_param(&mut self, node: &str, name: &str, value: Value) -> RunnerResult<()> {
        self.node_mut(node)?.params_mut().insert(name.to_string(), value);
        Ok(())
    }

    /// Result of the last completed invocation of `node`
    pub fn result_of(&self, node: &str) -> RunnerResult<&Params> {
        Ok(self.node(node)?.result())
    }

    /// All registered nodes
    pub fn nodes(&self) -> Vec<&ScriptNode> {
        let mut nodes = Vec::new();
        self.root.collect_nodes(&mut nodes);
        nodes
    }

    /// Snapshot the root-level value `name`; every reset restores it
    pub fn protect(&mut self, name: &str) -> RunnerResult<()> {
        match self.root.children.get(name) {
            Some(Token::Value(value)) => {
                self.protected.insert(name.to_string(), value.clone());
                Ok(())
            }
            Some(_) => Err(RunnerError::TokenConflict(name.to_string())),
            None => Err(RunnerError::UndefinedToken(name.to_string())),
        }
    }

    /// Drop run variables at any depth and clear every node's params and
    /// result. Protected values are put back to their snapshots.
    pub fn reset_run_tokens(&mut self) {
        self.root.clear_run_tokens();
        for (name, pristine) in &self.protected {
            self.root
                .children
                .insert(name.clone(), Token::Value(pristine.clone()));
        }
        debug!("Namespace run tokens reset");
    }

    fn component_mut(&mut self, path: &str) -> Option<&mut Component> {
        if path.is_empty() {
            return Some(&mut self.root);
        }
        match self.token_mut(path)? {
            Token::Component(c) => Some(c),
            _ => None,
        }
    }

    fn token(&self, path: &str) -> Option<&Token> {
        let segments = split(path)?;
        let (last, parents) = segments.split_last()?;
        let mut component = &self.root;
        for segment in parents {
            match component.children.get(*segment)? {
                Token::Component(c) => component = c,
                _ => return None,
            }
        }
        component.children.get(*last)
    }

    fn token_mut(&mut self, path: &str) -> Option<&mut Token> {
        let segments = split(path)?;
        let (last, parents) = segments.split_last()?;
        let mut component = &mut self.root;
        for segment in parents {
            match component.children.get_mut(*segment)? {
                Token::Component(c) => component = c,
                _ => return None,
            }
        }
        component.children.get_mut(*last)
    }
}

fn split(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        None
    } else {
        Some(segments)
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn validate_name(name: &str) -> RunnerResult<()> {
    if name.is_empty() || name.contains('.') {
        return Err(RunnerError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn descend(value: &Value, rest: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn set_in_node(node: &mut ScriptNode, rest: &[&str], value: Value, path: &str) -> RunnerResult<()> {
    let conflict = || RunnerError::TokenConflict(path.to_string());
    match rest {
        ["params"] => match value {
            Value::Object(map) => {
                *node.params_mut() = map;
                Ok(())
            }
            _ => Err(conflict()),
        },
        ["params", key] => {
            node.params_mut().insert(key.to_string(), value);
            Ok(())
        }
        ["params", key, tail @ ..] => {
            let target = node
                .params_mut()
                .get_mut(*key)
                .ok_or_else(|| RunnerError::UndefinedToken(path.to_string()))?;
            set_in_value(target, tail, value).ok_or_else(|| RunnerError::UndefinedToken(path.to_string()))
        }
        _ => Err(conflict()),
    }
}

fn set_in_value(target: &mut Value, rest: &[&str], value: Value) -> Option<()> {
    let Some((last, parents)) = rest.split_last() else {
        *target = value;
        return Some(());
    };
    let mut current = target;
    for segment in parents {
        current = match current {
            Value::Object(map) => map.get_mut(*segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Some(())
        }
        Value::Array(items) => {
            let slot = items.get_mut(last.parse::<usize>().ok()?)?;
            *slot = value;
            Some(())
        }
        _ => None,
    }
}

fn remove_in_value(target: &mut Value, rest: &[&str]) -> Option<Value> {
    let (last, parents) = rest.split_last()?;
    let mut current = target;
    for segment in parents {
        current = match current {
            Value::Object(map) => map.get_mut(*segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    current.as_object_mut()?.remove(*last)
}

fn remove_in_map(map: &mut Params, rest: &[&str]) -> Option<Value> {
    let (first, tail) = rest.split_first()?;
    if tail.is_empty() {
        map.remove(*first)
    } else {
        remove_in_value(map.get_mut(*first)?, tail)
    }
}
