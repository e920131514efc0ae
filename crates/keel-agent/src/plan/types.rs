use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::catalog::RetryPolicy;

/// Result of intent classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub query_type: String,
    /// Candidate worker for reasoning-driven planning.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    pub correlation_id: String,
    pub priority: Priority,
    /// Overall run budget, checked at level boundaries.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    pub cost_usd: f64,
    /// Critical-path duration under the executor's scheduling rules.
    pub duration_ms: u64,
    pub worker_count: usize,
}

/// One worker invocation within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: String,
    /// Topological hint; dependencies are authoritative.
    pub order: u32,
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    /// Hard dependency: when it fails, dependents are skipped.
    pub required: bool,
    pub can_run_in_parallel: bool,
    pub depends_on: Vec<String>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub tools_needed: Vec<String>,
    pub estimated_duration_ms: u64,
    pub estimated_cost_usd: f64,
    pub max_execution_time_ms: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Stage ids along the first dependency cycle found, closed (first == last).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub query_type: String,
    pub workflow_id: Option<String>,
    pub workflow_version: Option<u32>,
    pub stages: Vec<Stage>,
    pub validation: Option<ValidationResult>,
    pub estimates: Estimates,
    /// Keys that must exist in state before the run.
    pub required_state: Vec<String>,
    /// Keys the plan promises to produce.
    pub expected_outputs: Vec<String>,
    pub context: PlanContext,
    pub original_query: String,
    pub classification: Classification,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Group stages into dependency levels: level 0 has no dependencies,
    /// level k sits one above its deepest dependency. Each level is sorted
    /// by `order`. Stages on a cycle or with dangling dependencies are left out.
    pub fn levels(&self) -> Vec<Vec<&Stage>> {
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        let mut remaining: Vec<&Stage> = self.stages.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|s| {
                let stage = *s;
                let dep_levels: Option<Vec<usize>> = stage
                    .depends_on
                    .iter()
                    .map(|d| level_of.get(d.as_str()).copied())
                    .collect();
                match dep_levels {
                    Some(levels) => {
                        let level = levels.into_iter().max().map_or(0, |m| m + 1);
                        level_of.insert(stage.stage_id.as_str(), level);
                        false
                    }
                    None => true,
                }
            });
            if remaining.len() == before {
                break;
            }
        }

        let depth = level_of.values().copied().max().map_or(0, |m| m + 1);
        let mut levels: Vec<Vec<&Stage>> = vec![Vec::new(); depth];
        for stage in &self.stages {
            if let Some(&l) = level_of.get(stage.stage_id.as_str()) {
                levels[l].push(stage);
            }
        }
        for level in &mut levels {
            level.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.stage_id.cmp(&b.stage_id)));
        }
        levels
    }
}

/// Split one level into execution segments: contiguous runs of parallel
/// stages run together, every other stage runs alone.
pub fn segments<'a>(level: &[&'a Stage]) -> Vec<Vec<&'a Stage>> {
    let mut out: Vec<Vec<&'a Stage>> = Vec::new();
    for &stage in level {
        match out.last_mut() {
            Some(seg)
                if stage.can_run_in_parallel
                    && seg.last().is_some_and(|s| s.can_run_in_parallel) =>
            {
                seg.push(stage)
            }
            _ => out.push(vec![stage]),
        }
    }
    out
}

/// A plan that passed validation. Immutable.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: ExecutionPlan,
}

impl ValidatedPlan {
    pub(crate) fn new(plan: ExecutionPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn into_plan(self) -> ExecutionPlan {
        self.plan
    }
}

impl std::ops::Deref for ValidatedPlan {
    type Target = ExecutionPlan;

    fn deref(&self) -> &ExecutionPlan {
        &self.plan
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage_id: String,
    pub error: String,
}

/// A degraded value a stage absorbed, disclosed with the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub stage_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VsEstimates {
    pub accuracy_percent: f64,
    pub cost_diff_usd: f64,
    pub actual_cost_usd: f64,
    pub actual_duration_ms: u64,
}

/// Outcome of one plan run. Every stage id lands in exactly one of
/// completed, failed or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub success: bool,
    pub stages_completed: Vec<String>,
    pub stages_failed: Vec<String>,
    pub stages_skipped: Vec<String>,
    pub duration_ms: u64,
    pub errors: Vec<StageError>,
    pub vs_estimates: VsEstimates,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub degradations: Vec<Degradation>,
}
