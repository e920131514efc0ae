use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogConfig;
use crate::error::{KeelError, Result};
use crate::workflow::WorkflowDefinition;

/// Top-level Keel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub tool_retry: ToolRetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

fn default_workspace() -> String { "~/.keel".to_string() }

/// Plan executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running parallel stages within a level.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Used when a stage has no worker-specific limit.
    #[serde(default = "default_stage_timeout_ms")]
    pub default_stage_timeout_ms: u64,
    /// Overall run budget, checked at level boundaries.
    #[serde(default = "default_plan_timeout_ms")]
    pub plan_timeout_ms: u64,
    /// Write a checkpoint after every dependency level.
    #[serde(default = "default_true")]
    pub checkpoint_each_level: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_stage_timeout_ms: default_stage_timeout_ms(),
            plan_timeout_ms: default_plan_timeout_ms(),
            checkpoint_each_level: true,
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_stage_timeout_ms() -> u64 { 30_000 }
fn default_plan_timeout_ms() -> u64 { 120_000 }
fn default_true() -> bool { true }

/// Per-tool circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (within the window) that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Time an open breaker waits before allowing a trial call.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_window_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 30 }

/// Retry configuration for tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRetryConfig {
    #[serde(default = "default_tool_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Randomize backoff by 0.8x to 1.2x.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ToolRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_tool_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: true,
        }
    }
}

fn default_tool_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8_000 }

/// Checkpoint / state persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite file backing the key-value store. Default: <workspace>/keel.db
    #[serde(default)]
    pub db_path: Option<String>,
    /// Fields whose serialized size exceeds this are externalized.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// TTL of externalized field references.
    #[serde(default = "default_reference_ttl")]
    pub reference_ttl_secs: u64,
    /// Field names that always stay inline regardless of size.
    #[serde(default = "default_inline_keys")]
    pub inline_keys: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            compression_threshold_bytes: default_compression_threshold(),
            reference_ttl_secs: default_reference_ttl(),
            inline_keys: default_inline_keys(),
        }
    }
}

fn default_compression_threshold() -> usize { 1024 }
fn default_reference_ttl() -> u64 { 86_400 }
fn default_inline_keys() -> Vec<String> {
    vec![
        "correlation_id".to_string(),
        "thread_id".to_string(),
        "query".to_string(),
        "vessel_imo".to_string(),
        crate::state::COMPLETED_AGENTS_KEY.to_string(),
    ]
}

/// A keyword rule for the intent classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub query_type: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Intent classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_query_type")]
    pub default_query_type: String,
    #[serde(default)]
    pub rules: Vec<ClassifierRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            default_query_type: default_query_type(),
            rules: vec![],
        }
    }
}

fn default_cache_ttl() -> u64 { 3_600 }
fn default_query_type() -> String { "general".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per-stage, 3 = per-tool-call (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_log_level() -> u8 { 2 }
fn default_batch_size() -> usize { 32 }
fn default_flush_interval_ms() -> u64 { 500 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| KeelError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| KeelError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Path of the SQLite key-value store.
    pub fn db_path(&self) -> PathBuf {
        match self.checkpoint.db_path {
            Some(ref p) => PathBuf::from(p),
            None => self.workspace_dir().join("keel.db"),
        }
    }

    /// Directory for JSONL run logs.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_ref()) {
            Some(dir) => PathBuf::from(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_KEEL_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_KEEL_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_KEEL_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_KEEL_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_KEEL_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.plan_timeout_ms, 120_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.checkpoint.compression_threshold_bytes, 1024);
        assert!(config
            .checkpoint
            .inline_keys
            .contains(&"correlation_id".to_string()));
        assert!(config.log.is_none());
        assert!(config.workflows.is_empty());
    }

    #[test]
    fn test_engine_and_breaker_overrides() {
        let toml_str = r#"
[engine]
max_concurrency = 8
plan_timeout_ms = 5000

[breaker]
failure_threshold = 3
cooldown_secs = 10

[checkpoint]
db_path = "/tmp/keel-test.db"
compression_threshold_bytes = 256
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.default_stage_timeout_ms, 30_000);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.window_secs, 60);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/keel-test.db"));
        assert_eq!(config.checkpoint.compression_threshold_bytes, 256);
    }

    #[test]
    fn test_workspace_paths() {
        let config = AppConfig {
            workspace: "/srv/keel".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/keel/keel.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/keel/logs"));
    }
}
