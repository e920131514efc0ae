use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use keel_core::catalog::Catalog;
use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;

use super::types::{ExecutionPlan, ValidatedPlan, ValidationResult};

/// Structural and semantic checks a plan must pass before it may run.
pub struct PlanValidator {
    catalog: Arc<Catalog>,
}

impl PlanValidator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Run every check and collect the findings. Never fails.
    pub fn validate(&self, plan: &ExecutionPlan, state: &SharedState) -> ValidationResult {
        let mut result = ValidationResult::default();

        if plan.stages.is_empty() {
            result
                .warnings
                .push("plan has no stages; nothing left to run".to_string());
        }

        self.check_structure(plan, &mut result);
        self.check_catalog(plan, &mut result);
        self.check_data_flow(plan, state, &mut result);

        result.valid = result.errors.is_empty();
        result
    }

    /// Validate and, on success, wrap the plan so it can be executed.
    pub fn validate_plan(
        &self,
        mut plan: ExecutionPlan,
        state: &SharedState,
    ) -> Result<ValidatedPlan> {
        let result = self.validate(&plan, state);
        for w in &result.warnings {
            debug!(plan_id = %plan.plan_id, warning = %w, "Plan warning");
        }
        if !result.valid {
            warn!(
                plan_id = %plan.plan_id,
                errors = result.errors.len(),
                "Plan rejected"
            );
            if let Some(cycle) = &result.cycle {
                return Err(KeelError::CycleDetected {
                    path: cycle.join(" -> "),
                });
            }
            return Err(KeelError::PlanInvalid {
                errors: result.errors,
            });
        }
        plan.validation = Some(result);
        Ok(ValidatedPlan::new(plan))
    }

    fn check_structure(&self, plan: &ExecutionPlan, result: &mut ValidationResult) {
        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &plan.stages {
            if !seen.insert(stage.stage_id.as_str()) {
                result
                    .errors
                    .push(format!("duplicate stage id '{}'", stage.stage_id));
            }
        }

        let order_of: HashMap<&str, u32> = plan
            .stages
            .iter()
            .map(|s| (s.stage_id.as_str(), s.order))
            .collect();
        for stage in &plan.stages {
            for dep in &stage.depends_on {
                match order_of.get(dep.as_str()) {
                    None => result.errors.push(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.stage_id, dep
                    )),
                    Some(&order) if order >= stage.order => result.errors.push(format!(
                        "stage '{}' depends on stage '{}', which is not ordered before it",
                        stage.stage_id, dep
                    )),
                    Some(_) => {}
                }
            }
        }

        if let Some(cycle) = find_cycle(plan) {
            result
                .errors
                .push(format!("dependency cycle: {}", cycle.join(" -> ")));
            result.cycle = Some(cycle);
        }
    }

    fn check_catalog(&self, plan: &ExecutionPlan, result: &mut ValidationResult) {
        for stage in &plan.stages {
            match self.catalog.get_worker(&stage.agent_id) {
                None => result.errors.push(format!(
                    "stage '{}': worker '{}' is not in the catalog",
                    stage.stage_id, stage.agent_id
                )),
                Some(def) if !def.enabled => result.errors.push(format!(
                    "stage '{}': worker '{}' is disabled",
                    stage.stage_id, stage.agent_id
                )),
                Some(_) => {}
            }
            for tool in &stage.tools_needed {
                match self.catalog.get_tool(tool) {
                    None => result.errors.push(format!(
                        "stage '{}': tool '{}' is not in the catalog",
                        stage.stage_id, tool
                    )),
                    Some(def) if !def.enabled => result.errors.push(format!(
                        "stage '{}': tool '{}' is disabled",
                        stage.stage_id, tool
                    )),
                    Some(_) => {}
                }
            }
        }
    }

    /// Every required key must be present in state or produced by a stage
    /// with a smaller order.
    fn check_data_flow(
        &self,
        plan: &ExecutionPlan,
        state: &SharedState,
        result: &mut ValidationResult,
    ) {
        let mut ordered: Vec<_> = plan.stages.iter().collect();
        ordered.sort_by_key(|s| s.order);

        for stage in &ordered {
            for key in &stage.requires {
                let in_state = state.get(key).is_some_and(|v| !v.is_null());
                let produced = ordered
                    .iter()
                    .any(|s| s.order < stage.order && s.provides.contains(key));
                if !in_state && !produced {
                    result.errors.push(format!(
                        "stage '{}' requires '{}' which is neither in state nor produced earlier",
                        stage.stage_id, key
                    ));
                }
            }
        }
    }
}

/// Depth-first search over `depends_on` edges. Returns the first cycle found
/// as a closed path of stage ids.
fn find_cycle(plan: &ExecutionPlan) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(deps) = edges.get(id) {
            for dep in deps {
                if let Some(cycle) = visit(dep, edges, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let edges: HashMap<&str, Vec<&str>> = plan
        .stages
        .iter()
        .map(|s| {
            let deps = s
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| plan.stages.iter().any(|o| o.stage_id == *d))
                .collect();
            (s.stage_id.as_str(), deps)
        })
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for stage in &plan.stages {
        let mut path = Vec::new();
        if let Some(cycle) = visit(stage.stage_id.as_str(), &edges, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::generator::{PlanGenerator, PlanRequest};
    use crate::plan::types::Classification;
    use keel_core::catalog::{ToolDefinition, WorkerDefinition};
    use keel_test_utils::{maritime_catalog, voyage_state, voyage_workflow};

    fn voyage_plan() -> ExecutionPlan {
        let gen = PlanGenerator::new(Arc::new(maritime_catalog()), 60_000);
        let req = PlanRequest::new(
            "bunker plan",
            Classification {
                query_type: "voyage_planning".into(),
                agent_id: None,
                confidence: 1.0,
                reasoning: String::new(),
            },
        );
        gen.generate(&req, Some(&voyage_workflow()), &voyage_state())
            .unwrap()
    }

    fn validator() -> PlanValidator {
        PlanValidator::new(Arc::new(maritime_catalog()))
    }

    #[test]
    fn test_generated_plan_is_valid() {
        let plan = voyage_plan();
        let v = validator().validate(&plan, &voyage_state());
        assert!(v.valid, "errors: {:?}", v.errors);
        assert!(v.warnings.is_empty());

        let validated = validator().validate_plan(plan, &voyage_state()).unwrap();
        assert!(validated.validation.as_ref().is_some_and(|r| r.valid));
    }

    #[test]
    fn test_cycle_reported_with_closed_path() {
        let mut plan = voyage_plan();
        let first = plan.stages[0].stage_id.clone();
        let last = plan.stages[3].stage_id.clone();
        plan.stages[0].depends_on.push(last.clone());

        let v = validator().validate(&plan, &voyage_state());
        assert!(!v.valid);
        let cycle = v.cycle.clone().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&first) && cycle.contains(&last));

        let err = validator().validate_plan(plan, &voyage_state()).unwrap_err();
        match err {
            KeelError::CycleDetected { path } => assert!(path.contains(" -> ")),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_dangling_dependency_is_error() {
        let mut plan = voyage_plan();
        plan.stages[1].depends_on.push("s99_ghost".into());
        let v = validator().validate(&plan, &voyage_state());
        assert!(v.errors.iter().any(|e| e.contains("s99_ghost")));
    }

    #[test]
    fn test_forward_reference_is_error() {
        let mut plan = voyage_plan();
        // weather now also waits for bunker, which has a larger order.
        let bunker = plan.stages[2].stage_id.clone();
        plan.stages[1].depends_on.push(bunker.clone());
        let v = validator().validate(&plan, &voyage_state());
        assert!(!v.valid);
        assert!(v.cycle.is_none());
        assert_eq!(v.errors.len(), 1);
        assert!(v.errors[0].contains(&bunker));

        let err = validator().validate_plan(plan, &voyage_state()).unwrap_err();
        assert!(matches!(err, KeelError::PlanInvalid { .. }));
    }

    #[test]
    fn test_same_order_reference_is_error() {
        let mut plan = voyage_plan();
        let route = plan.stages[0].stage_id.clone();
        plan.stages[0].depends_on.push(route);
        let v = validator().validate(&plan, &voyage_state());
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("not ordered before")));
    }

    #[test]
    fn test_missing_input_rejected() {
        let plan = voyage_plan();
        let mut st = voyage_state();
        st.remove("origin_port");
        let err = validator().validate_plan(plan, &st).unwrap_err();
        match err {
            KeelError::PlanInvalid { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("origin_port"));
            }
            other => panic!("expected PlanInvalid, got {other}"),
        }
    }

    #[test]
    fn test_null_state_value_does_not_satisfy() {
        let plan = voyage_plan();
        let mut st = voyage_state();
        st.set("destination_port", serde_json::Value::Null);
        assert!(!validator().validate(&plan, &st).valid);
    }

    #[test]
    fn test_disabled_worker_and_tool() {
        let plan = voyage_plan();
        let mut workers: Vec<WorkerDefinition> = maritime_catalog()
            .list_enabled()
            .into_iter()
            .cloned()
            .collect();
        for w in &mut workers {
            if w.id == "weather_agent" {
                w.enabled = false;
            }
        }
        let tools = vec![
            ToolDefinition::new("route_calculator").disabled(),
            ToolDefinition::new("weather_api"),
            ToolDefinition::new("fuel_prices"),
        ];
        let v = PlanValidator::new(Arc::new(Catalog::new(workers, tools)))
            .validate(&plan, &voyage_state());
        assert_eq!(v.errors.len(), 2);
        assert!(v.errors.iter().any(|e| e.contains("weather_agent")));
        assert!(v.errors.iter().any(|e| e.contains("route_calculator")));
    }

    #[test]
    fn test_empty_plan_is_valid_with_warning() {
        let mut plan = voyage_plan();
        plan.stages.clear();
        let v = validator().validate(&plan, &SharedState::new());
        assert!(v.valid);
        assert_eq!(v.warnings.len(), 1);
    }
}
