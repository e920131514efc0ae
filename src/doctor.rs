use keel_core::catalog::Catalog;
use keel_core::config::AppConfig;
use keel_core::workflow::WorkflowDefinition;
use keel_gateway::health_snapshot;
use keel_memory::SqliteKv;
use keel_tools::CircuitBreakerRegistry;

use crate::workers;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn pass(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

pub async fn run_doctor(config: &AppConfig) {
    let catalog = if config.catalog.workers.is_empty() {
        workers::default_catalog()
    } else {
        Catalog::from_config(&config.catalog)
    };
    let workflows = if config.workflows.is_empty() {
        workers::default_workflows()
    } else {
        config.workflows.clone()
    };

    let checks = vec![
        check_workspace(config),
        check_catalog(&catalog),
        check_workflows(&catalog, &workflows),
        check_engine(config),
        check_store(config).await,
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !ws.is_dir() {
        return CheckResult::fail("Workspace", format!("{} (does not exist)", ws.display()));
    }
    let probe = ws.join(".doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(()) => {
            std::fs::remove_file(&probe).ok();
            CheckResult::pass("Workspace", ws.display().to_string())
        }
        Err(e) => CheckResult::fail("Workspace", format!("{} (not writable: {})", ws.display(), e)),
    }
}

/// Every enabled worker's required tools exist and are enabled.
fn check_catalog(catalog: &Catalog) -> CheckResult {
    let mut issues = Vec::new();
    for worker in catalog.list_enabled() {
        for tool in &worker.required_tools {
            match catalog.get_tool(tool) {
                None => issues.push(format!("{} requires unknown tool {}", worker.id, tool)),
                Some(t) if !t.enabled => {
                    issues.push(format!("{} requires disabled tool {}", worker.id, tool))
                }
                Some(_) => {}
            }
        }
    }

    if issues.is_empty() {
        CheckResult::pass(
            "Catalog",
            format!("{} workers, {} tools", catalog.worker_count(), catalog.tool_count()),
        )
    } else {
        CheckResult::fail("Catalog", issues.join("; "))
    }
}

fn check_workflows(catalog: &Catalog, workflows: &[WorkflowDefinition]) -> CheckResult {
    let mut issues = Vec::new();
    for wf in workflows {
        if wf.steps.is_empty() {
            issues.push(format!("{} has no steps", wf.id));
        }
        for step in &wf.steps {
            match catalog.get_worker(&step.agent_id) {
                None => issues.push(format!("{}: unknown worker {}", wf.id, step.agent_id)),
                Some(w) if !w.enabled => {
                    issues.push(format!("{}: worker {} is disabled", wf.id, step.agent_id))
                }
                Some(_) => {}
            }
        }
    }

    if issues.is_empty() {
        let types: Vec<&str> = workflows.iter().map(|w| w.query_type.as_str()).collect();
        CheckResult::pass("Workflows", types.join(", "))
    } else {
        CheckResult::fail("Workflows", issues.join("; "))
    }
}

fn check_engine(config: &AppConfig) -> CheckResult {
    let e = &config.engine;
    if e.max_concurrency == 0 {
        return CheckResult::fail("Engine", "max_concurrency must be at least 1");
    }
    if e.plan_timeout_ms < e.default_stage_timeout_ms {
        return CheckResult::fail(
            "Engine",
            format!(
                "plan_timeout_ms ({}) is shorter than default_stage_timeout_ms ({})",
                e.plan_timeout_ms, e.default_stage_timeout_ms
            ),
        );
    }
    CheckResult::pass(
        "Engine",
        format!("concurrency {}, plan timeout {}ms", e.max_concurrency, e.plan_timeout_ms),
    )
}

async fn check_store(config: &AppConfig) -> CheckResult {
    let db_path = config.db_path();
    let store = match SqliteKv::open(&db_path) {
        Ok(s) => s,
        Err(e) => return CheckResult::fail("Checkpoint store", format!("{}: {}", db_path.display(), e)),
    };
    let breakers = CircuitBreakerRegistry::new(&config.breaker);
    let snap = health_snapshot(&breakers, &store).await;
    let store_health = snap.checkpoint_store;
    if !store_health.reachable {
        return CheckResult::fail(
            "Checkpoint store",
            store_health.error.unwrap_or_else(|| "unreachable".into()),
        );
    }
    let freshness = match store_health.last_write_age_secs {
        Some(age) => format!("last write {}s ago", age),
        None => "no checkpoints yet".to_string(),
    };
    CheckResult::pass(
        "Checkpoint store",
        format!("{} ({})", db_path.display(), freshness),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::catalog::WorkerDefinition;
    use keel_core::workflow::WorkflowStep;

    #[test]
    fn test_default_catalog_is_consistent() {
        let catalog = workers::default_catalog();
        assert!(check_catalog(&catalog).ok);
        assert!(check_workflows(&catalog, &workers::default_workflows()).ok);
    }

    #[test]
    fn test_unknown_worker_in_workflow() {
        let catalog = Catalog::new(vec![WorkerDefinition::new("route_agent")], vec![]);
        let wf = WorkflowDefinition::new(
            "wf",
            "voyage_planning",
            vec![WorkflowStep::new("route_agent"), WorkflowStep::new("ghost_agent")],
        );
        let check = check_workflows(&catalog, &[wf]);
        assert!(!check.ok);
        assert!(check.detail.contains("ghost_agent"));
    }

    #[test]
    fn test_missing_tool() {
        let catalog = Catalog::new(
            vec![WorkerDefinition::new("route_agent").tools(&["route_calculator"])],
            vec![],
        );
        let check = check_catalog(&catalog);
        assert!(!check.ok);
        assert!(check.detail.contains("route_calculator"));
    }
}
