use std::io::Write;

use keel_core::catalog::{BackoffStrategy, Catalog, FallbackKind};
use keel_core::config::AppConfig;
use keel_core::error::KeelError;
use keel_core::state::SharedState;
use keel_core::workflow::WorkflowTable;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
workspace = "/tmp/keel-test"

[engine]
max_concurrency = 2
default_stage_timeout_ms = 5000
plan_timeout_ms = 60000
checkpoint_each_level = false

[breaker]
failure_threshold = 3
window_secs = 30
cooldown_secs = 10

[tool_retry]
max_retries = 1
initial_backoff_ms = 200
jitter = false

[checkpoint]
db_path = "/tmp/keel-test/state.db"
compression_threshold_bytes = 2048

[classifier]
default_query_type = "general"

[[classifier.rules]]
query_type = "bunker_planning"
keywords = ["bunker", "fuel"]

[log]
level = 3
batch_size = 8

[gateway]
bind = "0.0.0.0:9999"

[[catalog.workers]]
id = "route_agent"
consumes = ["origin_port", "destination_port"]
produces = ["route_data"]
required_tools = ["route_calculator"]
estimated_cost_usd = 0.01
retry = { max_retries = 3, backoff_ms = 100, strategy = "linear" }

[[catalog.workers]]
id = "bunker_agent"
consumes = ["route_data"]
produces = ["bunker_plan"]
can_run_in_parallel = true

[[catalog.tools]]
id = "route_calculator"
cost_class = "medium"
fallback = "great_circle"

[[workflows]]
id = "bunker_linear"
query_type = "bunker_planning"
steps = [
    { agent_id = "route_agent" },
    { agent_id = "bunker_agent", guard = { op = "present", key = "route_data" } },
]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.workspace, "/tmp/keel-test");
    assert_eq!(config.engine.max_concurrency, 2);
    assert!(!config.engine.checkpoint_each_level);
    assert_eq!(config.breaker.failure_threshold, 3);
    assert_eq!(config.tool_retry.max_retries, 1);
    assert!(!config.tool_retry.jitter);
    assert_eq!(config.db_path().to_str(), Some("/tmp/keel-test/state.db"));
    assert_eq!(config.checkpoint.compression_threshold_bytes, 2048);
    // Unset fields keep their defaults.
    assert_eq!(config.checkpoint.reference_ttl_secs, 86_400);
    assert_eq!(config.classifier.rules[0].keywords, vec!["bunker", "fuel"]);

    let log = config.log.as_ref().expect("log section");
    assert_eq!(log.level, 3);
    assert_eq!(log.flush_interval_ms, 500);
    assert_eq!(config.log_dir().to_str(), Some("/tmp/keel-test/logs"));
    assert_eq!(config.gateway.as_ref().unwrap().bind, "0.0.0.0:9999");

    let catalog = Catalog::from_config(&config.catalog);
    assert_eq!(catalog.worker_count(), 2);
    let route = catalog.get_worker("route_agent").unwrap();
    assert_eq!(route.retry.max_retries, 3);
    assert_eq!(route.retry.strategy, BackoffStrategy::Linear);
    assert_eq!(route.max_execution_time_ms, 30_000);
    assert!(catalog.get_worker("bunker_agent").unwrap().can_run_in_parallel);
    assert_eq!(
        catalog.get_tool("route_calculator").unwrap().fallback,
        FallbackKind::GreatCircle
    );

    let table = WorkflowTable::from_definitions(config.workflows.clone());
    let wf = table.get("bunker_planning").unwrap();
    assert_eq!(wf.version, 1);
    assert!(!wf.steps[1].guard_passes(&SharedState::new()));
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("KEEL_TEST_BIND", "127.0.0.1:4444");
    let toml_content = r#"
[gateway]
bind = "${KEEL_TEST_BIND}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    assert_eq!(config.gateway.unwrap().bind, "127.0.0.1:4444");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"workspace = \"/tmp/keel-min\"\n").unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.plan_timeout_ms, 120_000);
    assert_eq!(config.breaker.failure_threshold, 5);
    assert!(config.checkpoint.enabled);
    assert!(config.log.is_none());
    assert!(config.workflows.is_empty());
    assert_eq!(config.db_path().to_str(), Some("/tmp/keel-min/keel.db"));
}

#[test]
fn test_missing_and_malformed_files() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/keel.toml")).unwrap_err();
    assert!(matches!(err, KeelError::ConfigNotFound(_)));

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine]\nmax_concurrency = \"lots\"\n").unwrap();
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, KeelError::Config(_)));
}
