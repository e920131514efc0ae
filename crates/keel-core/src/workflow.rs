//! Config-driven workflows: versioned intent → step tables with guard predicates.
//!
//! Guards are plain data evaluated against [`SharedState`]; there is no
//! embedded code execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::SharedState;

/// Guard predicate over the shared state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    /// Key is present (any value other than null).
    Present { key: String },
    /// Key is absent or null.
    Absent { key: String },
    Equals { key: String, value: serde_json::Value },
    NotEquals { key: String, value: serde_json::Value },
    /// String value contains a substring.
    Contains { key: String, substr: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    /// Compact string form: `key == "v"`, `key != "v"`, `key contains "s"`.
    Expr { expr: String },
}

impl Condition {
    pub fn present(key: impl Into<String>) -> Self {
        Condition::Present { key: key.into() }
    }

    pub fn absent(key: impl Into<String>) -> Self {
        Condition::Absent { key: key.into() }
    }

    pub fn evaluate(&self, state: &SharedState) -> bool {
        match self {
            Condition::Always => true,
            Condition::Present { key } => state.get(key).is_some_and(|v| !v.is_null()),
            Condition::Absent { key } => state.get(key).map_or(true, |v| v.is_null()),
            Condition::Equals { key, value } => state.get(key) == Some(value),
            Condition::NotEquals { key, value } => {
                state.get(key).is_some_and(|v| v != value)
            }
            Condition::Contains { key, substr } => state
                .get_str(key)
                .is_some_and(|s| s.contains(substr.as_str())),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(state)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(state)),
            Condition::Not { condition } => !condition.evaluate(state),
            Condition::Expr { expr } => evaluate_expr(expr, state),
        }
    }
}

/// Evaluate a simple string expression against the state.
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_expr(expr: &str, state: &SharedState) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return state.get_str(key).is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return state.get(key).is_some_and(|v| !json_matches(v, value));
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return state.get(key).is_some_and(|v| json_matches(v, value));
    }

    false
}

/// Compare a JSON value with a literal from an expression.
fn json_matches(v: &serde_json::Value, literal: &str) -> bool {
    match v {
        serde_json::Value::String(s) => s == literal,
        other => other.to_string() == literal,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

/// One step of a config-driven workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub agent_id: String,
    /// Hard dependency for downstream stages.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Step is skipped when the guard evaluates false.
    #[serde(default)]
    pub guard: Option<Condition>,
    /// Extra ordering edges to earlier steps, by agent id.
    #[serde(default)]
    pub after: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            required: true,
            guard: None,
            after: vec![],
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_guard(mut self, guard: Condition) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn after(mut self, agent_ids: &[&str]) -> Self {
        self.after = agent_ids.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn guard_passes(&self, state: &SharedState) -> bool {
        self.guard.as_ref().map_or(true, |g| g.evaluate(state))
    }
}

/// A statically ordered step list for one query type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub query_type: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, query_type: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            query_type: query_type.into(),
            description: String::new(),
            steps,
        }
    }

    /// First step that still has to run: guard passes and the agent has
    /// not been recorded as completed.
    pub fn next_step(&self, state: &SharedState) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.guard_passes(state) && !state.is_agent_completed(&s.agent_id))
    }
}

/// Query type → workflow mapping. Immutable; replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTable {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowTable {
    /// Build from definitions. When a query type appears more than once,
    /// the highest version wins.
    pub fn from_definitions(defs: Vec<WorkflowDefinition>) -> Self {
        let mut workflows: BTreeMap<String, WorkflowDefinition> = BTreeMap::new();
        for def in defs {
            match workflows.get(&def.query_type) {
                Some(existing) if existing.version >= def.version => {
                    debug!(
                        query_type = %def.query_type,
                        kept = existing.version,
                        ignored = def.version,
                        "Ignoring older workflow version"
                    );
                }
                _ => {
                    workflows.insert(def.query_type.clone(), def);
                }
            }
        }
        Self { workflows }
    }

    pub fn get(&self, query_type: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(query_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
