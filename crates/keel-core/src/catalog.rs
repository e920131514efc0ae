use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Backoff growth between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Retry policy for a worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 { 2 }
fn default_backoff_ms() -> u64 { 250 }
fn default_max_backoff_ms() -> u64 { 10_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            strategy: BackoffStrategy::default(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based: the wait after the first failure is `attempt = 0`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Linear => self.backoff_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => self
                .backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        };
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Degraded-response strategy for a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// Reuse a cached result; otherwise report insufficient data.
    #[default]
    InsufficientData,
    /// Reuse a cached result; otherwise no fallback.
    CachedOnly,
    /// Cached result, else a straight-line route estimate from coordinates.
    GreatCircle,
    /// Never substitute.
    None,
}

/// Relative cost class of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    #[default]
    Low,
    Medium,
    High,
}

/// Catalog entry for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// State keys the worker consumes.
    #[serde(default)]
    pub consumes: Vec<String>,
    /// State keys the worker produces.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub optional_tools: Vec<String>,
    #[serde(default)]
    pub can_run_in_parallel: bool,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default = "default_estimated_duration_ms")]
    pub estimated_duration_ms: u64,
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_agent_type() -> String { "specialist".to_string() }
fn default_estimated_duration_ms() -> u64 { 1_000 }
fn default_max_execution_time_ms() -> u64 { 30_000 }
fn default_enabled() -> bool { true }

impl WorkerDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type: default_agent_type(),
            consumes: vec![],
            produces: vec![],
            required_tools: vec![],
            optional_tools: vec![],
            can_run_in_parallel: false,
            estimated_cost_usd: 0.0,
            estimated_duration_ms: default_estimated_duration_ms(),
            max_execution_time_ms: default_max_execution_time_ms(),
            retry: RetryPolicy::default(),
            enabled: true,
        }
    }

    pub fn consumes(mut self, keys: &[&str]) -> Self {
        self.consumes = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn produces(mut self, keys: &[&str]) -> Self {
        self.produces = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn tools(mut self, tools: &[&str]) -> Self {
        self.required_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.can_run_in_parallel = true;
        self
    }

    pub fn estimates(mut self, cost_usd: f64, duration_ms: u64) -> Self {
        self.estimated_cost_usd = cost_usd;
        self.estimated_duration_ms = duration_ms;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.max_execution_time_ms = ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Catalog entry for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    #[serde(default)]
    pub cost_class: CostClass,
    #[serde(default)]
    pub latency_min_ms: u64,
    #[serde(default = "default_latency_max_ms")]
    pub latency_max_ms: u64,
    /// Advisory calls-per-minute limit (0 = unlimited).
    #[serde(default)]
    pub rate_limit_per_min: u32,
    #[serde(default)]
    pub fallback: FallbackKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_latency_max_ms() -> u64 { 10_000 }

impl ToolDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cost_class: CostClass::default(),
            latency_min_ms: 0,
            latency_max_ms: default_latency_max_ms(),
            rate_limit_per_min: 0,
            fallback: FallbackKind::default(),
            enabled: true,
        }
    }

    pub fn with_fallback(mut self, kind: FallbackKind) -> Self {
        self.fallback = kind;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Serialized shape of the catalog (`[[catalog.workers]]`, `[[catalog.tools]]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Static registry of workers and tools. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    workers: BTreeMap<String, WorkerDefinition>,
    tools: BTreeMap<String, ToolDefinition>,
}

impl Catalog {
    pub fn new(workers: Vec<WorkerDefinition>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            workers: workers.into_iter().map(|w| (w.id.clone(), w)).collect(),
            tools: tools.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        Self::new(config.workers.clone(), config.tools.clone())
    }

    /// Load a standalone catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| KeelError::ConfigNotFound(path.display().to_string()))?;
        let config: CatalogConfig =
            toml::from_str(&content).map_err(|e| KeelError::Config(e.to_string()))?;
        Ok(Self::from_config(&config))
    }

    pub fn get_worker(&self, id: &str) -> Option<&WorkerDefinition> {
        self.workers.get(id)
    }

    pub fn get_tool(&self, id: &str) -> Option<&ToolDefinition> {
        self.tools.get(id)
    }

    /// Enabled workers, ordered by id.
    pub fn list_enabled(&self) -> Vec<&WorkerDefinition> {
        self.workers.values().filter(|w| w.enabled).collect()
    }

    pub fn enabled_tools(&self) -> Vec<&ToolDefinition> {
        self.tools.values().filter(|t| t.enabled).collect()
    }

    /// Enabled workers that produce `key`, cheapest first, then by id.
    pub fn producers_of(&self, key: &str) -> Vec<&WorkerDefinition> {
        let mut found: Vec<&WorkerDefinition> = self
            .list_enabled()
            .into_iter()
            .filter(|w| w.produces.iter().any(|p| p == key))
            .collect();
        found.sort_by(|a, b| {
            a.estimated_cost_usd
                .partial_cmp(&b.estimated_cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_catalog_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(
            br#"
[[workers]]
id = "weather_agent"
consumes = ["route_data"]
produces = ["weather_forecast"]
required_tools = ["weather_api"]
enabled = false

[[tools]]
id = "weather_api"
latency_max_ms = 4000
"#,
        )
        .unwrap();

        let catalog = Catalog::load(tmp.path()).unwrap();
        assert_eq!(catalog.worker_count(), 1);
        assert!(catalog.list_enabled().is_empty());
        let tool = catalog.get_tool("weather_api").unwrap();
        assert_eq!(tool.latency_max_ms, 4000);
        assert_eq!(tool.fallback, FallbackKind::InsufficientData);

        let missing = Catalog::load(Path::new("/nonexistent/catalog.toml")).unwrap_err();
        assert!(matches!(missing, KeelError::ConfigNotFound(_)));
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: 100,
            strategy: BackoffStrategy::Exponential,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 100,
            strategy: BackoffStrategy::Linear,
            max_backoff_ms: 10_000,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(300));
    }

    #[test]
    fn test_catalog_lookup_and_enabled() {
        let catalog = Catalog::new(
            vec![
                WorkerDefinition::new("route_agent").produces(&["route"]),
                WorkerDefinition::new("legacy_agent").disabled(),
            ],
            vec![ToolDefinition::new("maritime_route")],
        );
        assert!(catalog.get_worker("route_agent").is_some());
        assert!(catalog.get_tool("maritime_route").is_some());
        assert!(catalog.get_tool("nope").is_none());
        let enabled: Vec<&str> = catalog.list_enabled().iter().map(|w| w.id.as_str()).collect();
        assert_eq!(enabled, vec!["route_agent"]);
    }

    #[test]
    fn test_producers_cheapest_first() {
        let catalog = Catalog::new(
            vec![
                WorkerDefinition::new("b_pricer").produces(&["prices"]).estimates(0.02, 100),
                WorkerDefinition::new("a_pricer").produces(&["prices"]).estimates(0.02, 100),
                WorkerDefinition::new("cheap_pricer").produces(&["prices"]).estimates(0.001, 100),
            ],
            vec![],
        );
        let ids: Vec<&str> = catalog.producers_of("prices").iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["cheap_pricer", "a_pricer", "b_pricer"]);
    }

    #[test]
    fn test_catalog_from_toml() {
        let toml_str = r#"
[[workers]]
id = "route_agent"
consumes = ["origin_port", "destination_port"]
produces = ["route"]
required_tools = ["maritime_route"]
estimated_cost_usd = 0.01

[workers.retry]
max_retries = 2
backoff_ms = 100
strategy = "linear"

[[tools]]
id = "maritime_route"
cost_class = "medium"
fallback = "great_circle"
"#;
        let config: CatalogConfig = toml::from_str(toml_str).unwrap();
        let catalog = Catalog::from_config(&config);
        let w = catalog.get_worker("route_agent").unwrap();
        assert_eq!(w.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(w.max_execution_time_ms, 30_000);
        assert!(w.enabled);
        let t = catalog.get_tool("maritime_route").unwrap();
        assert_eq!(t.fallback, FallbackKind::GreatCircle);
        assert_eq!(t.cost_class, CostClass::Medium);
    }
}
