// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Routine Domain Model
//!
//! A [`Routine`] is either a leaf (`single_step`) executed by Tier3, or a
//! composite (`multi_step`) whose [`RoutineGraph`] Tier2 walks node by node.
//!
//! ```yaml
//! id: summarize-and-route
//! name: Summarize and route
//! inputs:
//!   - name: text
//! outputs:
//!   - name: route
//! type: multi_step
//! graph:
//!   start: summarize
//!   nodes:
//!     - id: summarize
//!       type: routine
//!       routine: { id: s, name: s, type: single_step, step: { prompt: "..." } }
//!   edges: []
//! ```
//!
//! Only edges carrying a `loop_limit` may lead back to a node that was already
//! visited; [`Routine::validate`] rejects graphs whose plain edges form a cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::errors::ExecutionError;
use crate::domain::llm::ToolDefinition;
use crate::domain::resources::Credits;
use crate::domain::step::StrategyType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<IoSpec>,
    #[serde(default)]
    pub outputs: Vec<IoSpec>,
    #[serde(flatten)]
    pub kind: RoutineKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutineKind {
    SingleStep { step: StepDefinition },
    MultiStep { graph: RoutineGraph },
}

/// Declared routine input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl IoSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            schema: None,
            description: None,
        }
    }
}

impl Routine {
    pub fn single_step(id: impl Into<String>, step: StepDefinition) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: RoutineKind::SingleStep { step },
        }
    }

    pub fn multi_step(id: impl Into<String>, graph: RoutineGraph) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: RoutineKind::MultiStep { graph },
        }
    }

    pub fn with_inputs<I: IntoIterator<Item = IoSpec>>(mut self, inputs: I) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn with_outputs<I: IntoIterator<Item = IoSpec>>(mut self, outputs: I) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, RoutineKind::MultiStep { .. })
    }

    /// The step a leaf routine hands to Tier3, carrying the routine's declared
    /// I/O when the step does not declare its own.
    pub fn leaf_step(&self) -> Option<StepDefinition> {
        match &self.kind {
            RoutineKind::SingleStep { step } => {
                let mut step = step.clone();
                if step.inputs.is_empty() {
                    step.inputs = self.inputs.clone();
                }
                if step.outputs.is_empty() {
                    step.outputs = self.outputs.clone();
                }
                Some(step)
            }
            RoutineKind::MultiStep { .. } => None,
        }
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &IoSpec> {
        self.inputs.iter().filter(|io| io.required)
    }

    pub fn validate(&self) -> Result<(), RoutineError> {
        if self.id.trim().is_empty() {
            return Err(RoutineError::MissingField("id".to_string()));
        }
        check_unique_names("input", &self.inputs)?;
        check_unique_names("output", &self.outputs)?;
        match &self.kind {
            RoutineKind::SingleStep { step } => step.validate(&self.id),
            RoutineKind::MultiStep { graph } => graph.validate(&self.id),
        }
    }
}

fn check_unique_names(what: &str, specs: &[IoSpec]) -> Result<(), RoutineError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(RoutineError::MissingField(format!("{what} name")));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(RoutineError::DuplicateName(format!("{what} '{}'", spec.name)));
        }
    }
    Ok(())
}

// ============================================================================
// Leaf steps
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Explicit strategy; inferred from the other fields when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteOption>,
    /// Ask the reasoning engine to pick a route when no condition matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_routing: Option<bool>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<IoSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<IoSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_credits: Option<Credits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_credits: Option<Credits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<String>,
}

impl StepDefinition {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn transform(ops: Vec<TransformOp>) -> Self {
        Self {
            transforms: ops,
            ..Self::default()
        }
    }

    pub fn routing(routes: Vec<RouteOption>) -> Self {
        Self {
            routes,
            ..Self::default()
        }
    }

    fn validate(&self, routine_id: &str) -> Result<(), RoutineError> {
        let needs_prompt = match self.strategy {
            Some(StrategyType::Conversational) | Some(StrategyType::Reasoning) => true,
            Some(_) => false,
            None => self.transforms.is_empty() && self.routes.is_empty(),
        };
        if needs_prompt && self.prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(RoutineError::MissingField(format!(
                "step prompt in routine '{routine_id}'"
            )));
        }
        if self.strategy == Some(StrategyType::Deterministic) && self.transforms.is_empty() {
            return Err(RoutineError::MissingField(format!(
                "transforms for deterministic step in routine '{routine_id}'"
            )));
        }
        if self.strategy == Some(StrategyType::Routing) && self.routes.is_empty() {
            return Err(RoutineError::MissingField(format!(
                "routes for routing step in routine '{routine_id}'"
            )));
        }
        let mut labels = HashSet::new();
        for route in &self.routes {
            if !labels.insert(route.label.as_str()) {
                return Err(RoutineError::DuplicateName(format!("route '{}'", route.label)));
            }
        }
        Ok(())
    }
}

/// Side-effect-free transform applied by the deterministic strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// `output <- input` for every entry.
    Copy { mappings: BTreeMap<String, String> },
    /// Render a handlebars template against the inputs.
    Template { output: String, template: String },
    Constant { output: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RouteOption {
    pub fn new(label: impl Into<String>, when: Option<Condition>) -> Self {
        Self {
            label: label.into(),
            when,
            description: None,
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    Equals { variable: String, value: Value },
    Truthy { variable: String },
    Falsy { variable: String },
    /// True when the named node recorded a failure under the `continue` policy.
    StepFailed { node: String },
}

impl Condition {
    pub fn evaluate(&self, variables: &Map<String, Value>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equals { variable, value } => lookup(variables, variable) == Some(value),
            Condition::Truthy { variable } => lookup(variables, variable).is_some_and(is_truthy),
            Condition::Falsy { variable } => !lookup(variables, variable).is_some_and(is_truthy),
            Condition::StepFailed { node } => variables
                .get(&failed_flag(node))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Variable recording that `node` failed and the run continued past it.
pub fn failed_flag(node: &str) -> String {
    format!("{node}.failed")
}

/// Exact key first, then a dotted path into nested objects.
pub fn lookup<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = variables.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineGraph {
    pub start: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// routine input name -> run variable
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_map: BTreeMap<String, String>,
    /// routine output name -> run variable
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_map: BTreeMap<String, String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Routine { routine: Box<Routine> },
    Parallel { branches: Vec<RoutineGraph> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Fail,
    Continue,
    Retry { max_attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Condition,
    /// Number of times this edge may lead back to an already visited node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_limit: Option<u32>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Condition::Always,
            loop_limit: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn looping(mut self, limit: u32) -> Self {
        self.loop_limit = Some(limit);
        self
    }
}

impl Node {
    pub fn routine(id: impl Into<String>, routine: Routine) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Routine {
                routine: Box::new(routine),
            },
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
            on_failure: FailurePolicy::Fail,
        }
    }

    pub fn parallel(id: impl Into<String>, branches: Vec<RoutineGraph>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Parallel { branches },
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
            on_failure: FailurePolicy::Fail,
        }
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn map_input(mut self, routine_input: impl Into<String>, variable: impl Into<String>) -> Self {
        self.input_map.insert(routine_input.into(), variable.into());
        self
    }

    pub fn map_output(mut self, routine_output: impl Into<String>, variable: impl Into<String>) -> Self {
        self.output_map.insert(routine_output.into(), variable.into());
        self
    }
}

impl RoutineGraph {
    pub fn new(start: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            start: start.into(),
            nodes,
            edges,
        }
    }

    /// Linear chain `n0 -> n1 -> ...`.
    pub fn sequence(nodes: Vec<Node>) -> Self {
        let start = nodes.first().map(|n| n.id.clone()).unwrap_or_default();
        let edges = nodes
            .windows(2)
            .map(|pair| Edge::new(pair[0].id.clone(), pair[1].id.clone()))
            .collect();
        Self { start, nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = (usize, &'a Edge)> + 'a {
        self.edges.iter().enumerate().filter(move |(_, e)| e.from == from)
    }

    pub fn validate(&self, routine_id: &str) -> Result<(), RoutineError> {
        if self.nodes.is_empty() {
            return Err(RoutineError::EmptyGraph(routine_id.to_string()));
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(RoutineError::DuplicateName(format!("node '{}'", node.id)));
            }
            match &node.kind {
                NodeKind::Routine { routine } => routine.validate()?,
                NodeKind::Parallel { branches } => {
                    if branches.is_empty() {
                        return Err(RoutineError::EmptyGraph(format!("{routine_id}/{}", node.id)));
                    }
                    for (i, branch) in branches.iter().enumerate() {
                        branch.validate(&format!("{routine_id}/{}[{i}]", node.id))?;
                    }
                }
            }
            if let FailurePolicy::Retry { max_attempts: 0 } = node.on_failure {
                return Err(RoutineError::MissingField(format!(
                    "retry max_attempts for node '{}'",
                    node.id
                )));
            }
        }
        if !ids.contains(self.start.as_str()) {
            return Err(RoutineError::UnknownNode(self.start.clone()));
        }
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return Err(RoutineError::UnknownNode(end.clone()));
                }
            }
        }
        self.check_unguarded_cycles()
    }

    /// DFS over edges without a `loop_limit`; any cycle there would be an
    /// unbounded revisit.
    fn check_unguarded_cycles(&self) -> Result<(), RoutineError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in self.edges.iter().filter(|e| e.loop_limit.is_none()) {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        fn visit<'a>(
            node: &'a str,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
            visited: &mut HashSet<&'a str>,
            on_stack: &mut HashSet<&'a str>,
        ) -> Option<&'a str> {
            visited.insert(node);
            on_stack.insert(node);
            for next in adjacency.get(node).into_iter().flatten() {
                if on_stack.contains(next) {
                    return Some(next);
                }
                if !visited.contains(next) {
                    if let Some(hit) = visit(next, adjacency, visited, on_stack) {
                        return Some(hit);
                    }
                }
            }
            on_stack.remove(node);
            None
        }

        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                if let Some(hit) = visit(node.id.as_str(), &adjacency, &mut visited, &mut on_stack) {
                    return Err(RoutineError::UnguardedCycle(hit.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutineError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("duplicate {0}")]
    DuplicateName(String),

    #[error("routine '{0}' has an empty graph")]
    EmptyGraph(String),

    #[error("edge or start refers to unknown node '{0}'")]
    UnknownNode(String),

    #[error("cycle through node '{0}' has no loop_limit")]
    UnguardedCycle(String),

    #[error("failed to parse routine: {0}")]
    Parse(String),
}

impl From<RoutineError> for ExecutionError {
    fn from(err: RoutineError) -> Self {
        ExecutionError::validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(id: &str) -> Routine {
        Routine::single_step(id, StepDefinition::prompt("do it"))
    }

    #[test]
    fn test_composite_flag() {
        assert!(!leaf("a").is_composite());
        let composite = Routine::multi_step("c", RoutineGraph::sequence(vec![Node::routine("a", leaf("a"))]));
        assert!(composite.is_composite());
        assert!(composite.leaf_step().is_none());
    }

    #[test]
    fn test_leaf_step_inherits_routine_io() {
        let routine = leaf("a")
            .with_inputs([IoSpec::required("text")])
            .with_outputs([IoSpec::required("summary")]);
        let step = routine.leaf_step().unwrap();
        assert_eq!(step.inputs[0].name, "text");
        assert_eq!(step.outputs[0].name, "summary");
    }

    #[test]
    fn test_validate_rejects_unguarded_cycle() {
        let graph = RoutineGraph::new(
            "a",
            vec![Node::routine("a", leaf("a")), Node::routine("b", leaf("b"))],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        );
        let err = Routine::multi_step("loop", graph).validate().unwrap_err();
        assert_eq!(err, RoutineError::UnguardedCycle("a".to_string()));
    }

    #[test]
    fn test_validate_accepts_loop_limited_back_edge() {
        let graph = RoutineGraph::new(
            "a",
            vec![Node::routine("a", leaf("a")), Node::routine("b", leaf("b"))],
            vec![Edge::new("a", "b"), Edge::new("b", "a").looping(2)],
        );
        assert!(Routine::multi_step("loop", graph).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_edge_target() {
        let graph = RoutineGraph::new("a", vec![Node::routine("a", leaf("a"))], vec![Edge::new("a", "zzz")]);
        let err = Routine::multi_step("r", graph).validate().unwrap_err();
        assert_eq!(err, RoutineError::UnknownNode("zzz".to_string()));
    }

    #[test]
    fn test_conditions() {
        let vars = json!({"score": 3, "flag": "", "nested": {"ok": true}, "a.failed": true})
            .as_object()
            .cloned()
            .unwrap();
        assert!(Condition::Equals { variable: "score".into(), value: json!(3) }.evaluate(&vars));
        assert!(Condition::Falsy { variable: "flag".into() }.evaluate(&vars));
        assert!(Condition::Falsy { variable: "missing".into() }.evaluate(&vars));
        assert!(Condition::Truthy { variable: "nested.ok".into() }.evaluate(&vars));
        assert!(Condition::StepFailed { node: "a".into() }.evaluate(&vars));
        assert!(!Condition::StepFailed { node: "b".into() }.evaluate(&vars));
    }

    #[test]
    fn test_routine_yaml_shape() {
        let yaml = r#"
id: greet
name: Greet
inputs:
  - name: who
outputs:
  - name: greeting
type: single_step
step:
  transforms:
    - op: template
      output: greeting
      template: "Hello {{who}}"
"#;
        let routine: Routine = serde_yaml::from_str(yaml).unwrap();
        assert!(!routine.is_composite());
        assert!(routine.validate().is_ok());
        let step = routine.leaf_step().unwrap();
        assert!(matches!(step.transforms[0], TransformOp::Template { .. }));
    }
}
