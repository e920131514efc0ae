//! Plan generation.
//!
//! Config-driven: walk the workflow for the classified intent, drop steps
//! whose guard fails or that already completed, and wire dependencies from
//! data contracts plus explicit `after` edges.
//!
//! Reasoning-driven: for intents without a workflow, chain backwards from
//! the wanted keys through the catalog's `produces`/`consumes` contracts.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use keel_core::catalog::{Catalog, RetryPolicy};
use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;
use keel_core::types::new_correlation_id;
use keel_core::workflow::WorkflowDefinition;

use super::types::{
    segments, Classification, Estimates, ExecutionPlan, PlanContext, Priority, Stage,
};

/// Everything the generator needs besides the catalog and state.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub query: String,
    pub classification: Classification,
    pub correlation_id: String,
    pub priority: Priority,
    pub timeout_ms: Option<u64>,
    /// Keys to produce when no workflow matches the intent.
    pub target_outputs: Vec<String>,
}

impl PlanRequest {
    pub fn new(query: impl Into<String>, classification: Classification) -> Self {
        Self {
            query: query.into(),
            classification,
            correlation_id: new_correlation_id(),
            priority: Priority::Normal,
            timeout_ms: None,
            target_outputs: vec![],
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_targets(mut self, keys: &[&str]) -> Self {
        self.target_outputs = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Builds candidate plans. Pure: output depends only on the inputs and the catalog.
pub struct PlanGenerator {
    catalog: Arc<Catalog>,
    default_timeout_ms: u64,
}

impl PlanGenerator {
    pub fn new(catalog: Arc<Catalog>, default_timeout_ms: u64) -> Self {
        Self {
            catalog,
            default_timeout_ms,
        }
    }

    pub fn generate(
        &self,
        request: &PlanRequest,
        workflow: Option<&WorkflowDefinition>,
        state: &SharedState,
    ) -> Result<ExecutionPlan> {
        let stages = match workflow {
            Some(wf) => self.from_workflow(wf, state),
            None => self.from_catalog(request, state)?,
        };

        let mut plan = ExecutionPlan {
            plan_id: uuid::Uuid::new_v4().to_string(),
            query_type: request.classification.query_type.clone(),
            workflow_id: workflow.map(|w| w.id.clone()),
            workflow_version: workflow.map(|w| w.version),
            required_state: required_state(&stages),
            expected_outputs: expected_outputs(&stages),
            stages,
            validation: None,
            estimates: Estimates::default(),
            context: PlanContext {
                correlation_id: request.correlation_id.clone(),
                priority: request.priority,
                timeout_ms: request.timeout_ms.unwrap_or(self.default_timeout_ms),
            },
            original_query: request.query.clone(),
            classification: request.classification.clone(),
            created_at: Utc::now(),
        };
        plan.estimates = estimate(&plan);

        debug!(
            plan_id = %plan.plan_id,
            query_type = %plan.query_type,
            stages = plan.stages.len(),
            workflow = ?plan.workflow_id,
            "Plan generated"
        );
        Ok(plan)
    }

    fn from_workflow(&self, workflow: &WorkflowDefinition, state: &SharedState) -> Vec<Stage> {
        let pending: Vec<_> = workflow
            .steps
            .iter()
            .filter(|s| s.guard_passes(state) && !state.is_agent_completed(&s.agent_id))
            .collect();

        let mut stages: Vec<Stage> = pending
            .iter()
            .enumerate()
            .map(|(i, step)| self.stage_for(&step.agent_id, i as u32 + 1, step.required))
            .collect();

        let after: BTreeMap<String, Vec<String>> = pending
            .iter()
            .filter(|s| !s.after.is_empty())
            .map(|s| (s.agent_id.clone(), s.after.clone()))
            .collect();
        link_dependencies(&mut stages, &after);
        stages
    }

    fn from_catalog(&self, request: &PlanRequest, state: &SharedState) -> Result<Vec<Stage>> {
        let mut chosen: BTreeSet<String> = BTreeSet::new();
        let mut wanted: VecDeque<String> = request.target_outputs.iter().cloned().collect();

        if let Some(agent_id) = &request.classification.agent_id {
            chosen.insert(agent_id.clone());
            if let Some(def) = self.catalog.get_worker(agent_id) {
                wanted.extend(def.consumes.iter().cloned());
            }
        }

        if chosen.is_empty() && wanted.is_empty() {
            return Err(KeelError::NoWorkflow(request.classification.query_type.clone()));
        }

        let mut resolved: HashSet<String> = HashSet::new();
        while let Some(key) = wanted.pop_front() {
            if state.get(&key).is_some_and(|v| !v.is_null()) || !resolved.insert(key.clone()) {
                continue;
            }
            let already = chosen.iter().any(|id| {
                self.catalog
                    .get_worker(id)
                    .is_some_and(|w| w.produces.contains(&key))
            });
            if already {
                continue;
            }
            // Unresolvable keys are left for the validator to report.
            if let Some(producer) = self.catalog.producers_of(&key).first() {
                if chosen.insert(producer.id.clone()) {
                    wanted.extend(producer.consumes.iter().cloned());
                }
            }
        }

        let ordered = self.topological_order(&chosen);
        let mut stages: Vec<Stage> = ordered
            .iter()
            .enumerate()
            .map(|(i, id)| self.stage_for(id, i as u32 + 1, true))
            .collect();
        link_dependencies(&mut stages, &BTreeMap::new());
        Ok(stages)
    }

    /// Producers before consumers; ties broken by worker id. Workers caught
    /// in a contract cycle are appended in id order.
    fn topological_order(&self, chosen: &BTreeSet<String>) -> Vec<String> {
        let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for id in chosen {
            let consumes = self
                .catalog
                .get_worker(id)
                .map(|w| w.consumes.clone())
                .unwrap_or_default();
            let entry = deps.entry(id.as_str()).or_default();
            for other in chosen {
                if other == id {
                    continue;
                }
                let produces_needed = self
                    .catalog
                    .get_worker(other)
                    .is_some_and(|w| w.produces.iter().any(|p| consumes.contains(p)));
                if produces_needed {
                    entry.insert(other.as_str());
                }
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(chosen.len());
        let mut placed: HashSet<&str> = HashSet::new();
        loop {
            let ready: Option<&str> = deps
                .iter()
                .find(|(id, d)| !placed.contains(*id) && d.iter().all(|x| placed.contains(x)))
                .map(|(id, _)| *id);
            match ready {
                Some(id) => {
                    placed.insert(id);
                    order.push(id.to_string());
                }
                None => break,
            }
        }
        for id in chosen {
            if !placed.contains(id.as_str()) {
                order.push(id.clone());
            }
        }
        order
    }

    fn stage_for(&self, agent_id: &str, order: u32, required: bool) -> Stage {
        let stage_id = format!("s{:02}_{}", order, agent_id);
        match self.catalog.get_worker(agent_id) {
            Some(def) => Stage {
                stage_id,
                order,
                agent_id: def.id.clone(),
                agent_name: def.name.clone(),
                agent_type: def.agent_type.clone(),
                required,
                can_run_in_parallel: def.can_run_in_parallel,
                depends_on: vec![],
                provides: def.produces.clone(),
                requires: def.consumes.clone(),
                tools_needed: def.required_tools.clone(),
                estimated_duration_ms: def.estimated_duration_ms,
                estimated_cost_usd: def.estimated_cost_usd,
                max_execution_time_ms: def.max_execution_time_ms,
                retry: def.retry.clone(),
            },
            // Unknown workers still become stages so the validator can name them.
            None => Stage {
                stage_id,
                order,
                agent_id: agent_id.to_string(),
                agent_name: agent_id.to_string(),
                agent_type: "unknown".into(),
                required,
                can_run_in_parallel: false,
                depends_on: vec![],
                provides: vec![],
                requires: vec![],
                tools_needed: vec![],
                estimated_duration_ms: 0,
                estimated_cost_usd: 0.0,
                max_execution_time_ms: 0,
                retry: RetryPolicy::none(),
            },
        }
    }
}

/// Each stage depends on the latest earlier stage providing each key it
/// requires, plus the stages named by its `after` edges.
fn link_dependencies(stages: &mut [Stage], after: &BTreeMap<String, Vec<String>>) {
    for i in 0..stages.len() {
        let mut deps: Vec<String> = Vec::new();
        for key in &stages[i].requires {
            if let Some(provider) = stages[..i].iter().rev().find(|s| s.provides.contains(key)) {
                if !deps.contains(&provider.stage_id) {
                    deps.push(provider.stage_id.clone());
                }
            }
        }
        if let Some(agents) = after.get(&stages[i].agent_id) {
            for agent in agents {
                if let Some(target) = stages.iter().find(|s| &s.agent_id == agent) {
                    if target.stage_id != stages[i].stage_id && !deps.contains(&target.stage_id) {
                        deps.push(target.stage_id.clone());
                    }
                }
            }
        }
        stages[i].depends_on = deps;
    }
}

fn required_state(stages: &[Stage]) -> Vec<String> {
    let provided: HashSet<&String> = stages.iter().flat_map(|s| &s.provides).collect();
    let keys: BTreeSet<String> = stages
        .iter()
        .flat_map(|s| &s.requires)
        .filter(|k| !provided.contains(k))
        .cloned()
        .collect();
    keys.into_iter().collect()
}

fn expected_outputs(stages: &[Stage]) -> Vec<String> {
    let keys: BTreeSet<String> = stages.iter().flat_map(|s| s.provides.iter().cloned()).collect();
    keys.into_iter().collect()
}

/// Aggregate cost, and duration along the schedule the executor will follow.
pub(crate) fn estimate(plan: &ExecutionPlan) -> Estimates {
    let duration_ms = plan
        .levels()
        .iter()
        .map(|level| {
            segments(level)
                .iter()
                .map(|seg| seg.iter().map(|s| s.estimated_duration_ms).max().unwrap_or(0))
                .sum::<u64>()
        })
        .sum();
    Estimates {
        cost_usd: plan.stages.iter().map(|s| s.estimated_cost_usd).sum(),
        duration_ms,
        worker_count: plan
            .stages
            .iter()
            .map(|s| s.agent_id.as_str())
            .collect::<HashSet<_>>()
            .len(),
    }
}
