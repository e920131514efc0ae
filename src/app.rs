use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_agent::{
    CachedClassifier, Engine, EngineBuilder, KeywordClassifier, RunLogStats, RunLogger,
    WorkerRegistry,
};
use keel_core::catalog::Catalog;
use keel_core::config::{AppConfig, ClassifierConfig};
use keel_core::event::EventBus;
use keel_core::traits::KvStore;
use keel_memory::{Checkpointer, SqliteKv, StateCompressor};
use keel_tools::{CircuitBreakerRegistry, FallbackDispatcher, ResilientToolInvoker, ToolRegistry};

use crate::workers;

/// Fully wired runtime built from an [`AppConfig`].
pub struct App {
    pub config: AppConfig,
    pub engine: Engine,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub store: Arc<dyn KvStore>,
    pub checkpointer: Arc<Checkpointer>,
    pub event_bus: Arc<EventBus>,
}

/// Running JSONL logger; stop it to flush.
pub struct LoggerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<RunLogStats>,
}

impl LoggerHandle {
    pub async fn stop(self) -> RunLogStats {
        self.cancel.cancel();
        self.handle.await.unwrap_or_default()
    }
}

impl App {
    pub fn build(config: AppConfig) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&db_path)?);

        let catalog = if config.catalog.workers.is_empty() {
            info!("No catalog configured, using built-in maritime workers");
            workers::default_catalog()
        } else {
            Catalog::from_config(&config.catalog)
        };
        let catalog = Arc::new(catalog);
        let workflows = if config.workflows.is_empty() {
            workers::default_workflows()
        } else {
            config.workflows.clone()
        };

        let event_bus = Arc::new(EventBus::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(&config.breaker));
        let fallbacks = Arc::new(FallbackDispatcher::from_catalog(
            store.clone(),
            &catalog,
            Duration::from_secs(config.checkpoint.reference_ttl_secs),
        ));
        let mut tools = ToolRegistry::new();
        workers::register_tools(&mut tools);
        let invoker = ResilientToolInvoker::new(
            Arc::new(tools),
            breakers.clone(),
            fallbacks,
            config.tool_retry.clone(),
        )
        .with_event_bus(event_bus.clone());

        let mut registry = WorkerRegistry::new();
        workers::register_workers(&mut registry);

        let classifier_config = if config.classifier.rules.is_empty() {
            ClassifierConfig {
                rules: workers::default_rules(),
                ..config.classifier.clone()
            }
        } else {
            config.classifier.clone()
        };
        let classifier = CachedClassifier::new(
            KeywordClassifier::from_config(&classifier_config),
            store.clone(),
            Duration::from_secs(classifier_config.cache_ttl_secs),
        );

        let checkpointer = Arc::new(Checkpointer::new(
            store.clone(),
            StateCompressor::from_config(store.clone(), &config.checkpoint),
        ));

        let mut builder = EngineBuilder::new(catalog, registry, Arc::new(invoker))
            .workflows(workflows)
            .classifier(Arc::new(classifier))
            .event_bus(event_bus.clone())
            .config(config.engine.clone());
        if config.checkpoint.enabled {
            builder = builder.checkpointer(checkpointer.clone());
        } else {
            warn!("Checkpointing disabled; threads will not resume");
        }

        Ok(Self {
            engine: builder.build(),
            breakers,
            store,
            checkpointer,
            event_bus,
            config,
        })
    }

    /// Spawn the JSONL run logger if `[log]` is configured and enabled.
    pub fn start_logger(&self) -> Option<LoggerHandle> {
        let log = self.config.log.as_ref().filter(|l| l.enabled)?;
        let cancel = CancellationToken::new();
        let logger = RunLogger::from_config(self.config.log_dir(), log);
        let handle = tokio::spawn(logger.run(self.event_bus.clone(), cancel.clone()));
        Some(LoggerHandle { cancel, handle })
    }
}
