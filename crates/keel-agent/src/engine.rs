use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use keel_core::catalog::Catalog;
use keel_core::config::EngineConfig;
use keel_core::error::{KeelError, Result};
use keel_core::event::EventBus;
use keel_core::state::{SharedState, COMPLETED_AGENTS_KEY};
use keel_core::traits::ToolInvoker;
use keel_core::types::{new_correlation_id, ThreadId};
use keel_core::workflow::{WorkflowDefinition, WorkflowStep, WorkflowTable};
use keel_memory::Checkpointer;

use crate::executor::PlanExecutor;
use crate::intent::{IntentClassifier, KeywordClassifier};
use crate::plan::{
    Classification, ExecutionPlan, ExecutionResult, PlanGenerator, PlanRequest, PlanValidator,
    ValidatedPlan,
};
use crate::registry::WorkerRegistry;

/// Everything one `handle` call produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub thread_id: ThreadId,
    pub classification: Classification,
    pub plan: ExecutionPlan,
    pub result: ExecutionResult,
    pub state: SharedState,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    catalog: Arc<Catalog>,
    workers: WorkerRegistry,
    tools: Arc<dyn ToolInvoker>,
    workflows: Vec<WorkflowDefinition>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    checkpointer: Option<Arc<Checkpointer>>,
    event_bus: Option<Arc<EventBus>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(catalog: Arc<Catalog>, workers: WorkerRegistry, tools: Arc<dyn ToolInvoker>) -> Self {
        Self {
            catalog,
            workers,
            tools,
            workflows: vec![],
            classifier: None,
            checkpointer: None,
            event_bus: None,
            config: EngineConfig::default(),
        }
    }

    pub fn workflows(mut self, workflows: Vec<WorkflowDefinition>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let event_bus = self.event_bus.unwrap_or_default();
        let mut executor = PlanExecutor::new(Arc::new(self.workers), self.tools, &self.config)
            .with_event_bus(event_bus.clone());
        if let Some(cp) = &self.checkpointer {
            executor = executor.with_checkpointer(cp.clone());
        }

        Engine {
            generator: PlanGenerator::new(self.catalog.clone(), self.config.plan_timeout_ms),
            validator: PlanValidator::new(self.catalog.clone()),
            catalog: self.catalog,
            workflows: RwLock::new(Arc::new(WorkflowTable::from_definitions(self.workflows))),
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(KeywordClassifier::new(vec![], "general"))),
            executor,
            checkpointer: self.checkpointer,
            event_bus,
        }
    }
}

/// Classify, plan, validate, execute and checkpoint a query on a thread.
pub struct Engine {
    catalog: Arc<Catalog>,
    workflows: RwLock<Arc<WorkflowTable>>,
    classifier: Arc<dyn IntentClassifier>,
    generator: PlanGenerator,
    validator: PlanValidator,
    executor: PlanExecutor,
    checkpointer: Option<Arc<Checkpointer>>,
    event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn checkpointer(&self) -> Option<&Arc<Checkpointer>> {
        self.checkpointer.as_ref()
    }

    /// Current workflow table snapshot.
    pub fn workflows(&self) -> Arc<WorkflowTable> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new workflow table. Runs already planned keep the old one.
    pub fn reload_workflows(&self, defs: Vec<WorkflowDefinition>) {
        let table = Arc::new(WorkflowTable::from_definitions(defs));
        info!(workflows = table.len(), "Workflow table reloaded");
        *self.workflows.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    /// Supervisor routing: the next pending step of the workflow for `query_type`.
    pub fn next_step(&self, query_type: &str, state: &SharedState) -> Option<WorkflowStep> {
        self.workflows()
            .get(query_type)
            .and_then(|wf| wf.next_step(state))
            .cloned()
    }

    pub async fn classify(&self, query: &str) -> Result<Classification> {
        self.classifier.classify(query).await
    }

    /// Generate and validate a plan for an already classified query.
    pub fn plan_for(
        &self,
        request: &PlanRequest,
        state: &SharedState,
    ) -> Result<ValidatedPlan> {
        let table = self.workflows();
        let workflow = table.get(&request.classification.query_type);
        let plan = self.generator.generate(request, workflow, state)?;
        self.validator.validate_plan(plan, state)
    }

    /// Classify `query` and return a validated plan without running it.
    pub async fn plan(&self, query: &str, state: &SharedState) -> Result<ValidatedPlan> {
        let classification = self.classify(query).await?;
        self.plan_for(&PlanRequest::new(query, classification), state)
    }

    /// Run `query` on `thread_id`, resuming from the thread's latest
    /// checkpoint. A checkpoint that cannot be read, or a plan that fails
    /// validation, is an error; once execution starts the report is returned
    /// whatever the stages did.
    pub async fn handle(&self, query: &str, thread_id: &ThreadId) -> Result<RunReport> {
        let mut state = match &self.checkpointer {
            Some(cp) => cp
                .recover_latest(thread_id)
                .await?
                .map(|ctx| ctx.state)
                .unwrap_or_default(),
            None => SharedState::new(),
        };

        // A new question on the thread keeps resolved data but replans every step.
        if state.get_str("query").is_some_and(|q| q != query) {
            debug!(thread_id = %thread_id, "New query on thread; clearing completed steps");
            state.remove(COMPLETED_AGENTS_KEY);
        }

        let correlation_id = new_correlation_id();
        state.set_str("query", query);
        state.set_str("thread_id", thread_id.as_str());
        state.set_str("correlation_id", correlation_id.clone());

        let classification = self.classify(query).await?;
        let request =
            PlanRequest::new(query, classification.clone()).with_correlation_id(correlation_id);
        let plan = self.plan_for(&request, &state)?;

        info!(
            thread_id = %thread_id,
            query_type = %classification.query_type,
            stages = plan.stages.len(),
            "Handling query"
        );
        let outcome = self.executor.execute(&plan, state, Some(thread_id)).await;

        Ok(RunReport {
            thread_id: thread_id.clone(),
            classification,
            plan: plan.into_plan(),
            result: outcome.result,
            state: outcome.state,
        })
    }

    /// Remove every checkpoint of a thread.
    pub async fn purge(&self, thread_id: &ThreadId) -> Result<usize> {
        match &self.checkpointer {
            Some(cp) => cp.delete_thread(thread_id).await,
            None => Err(KeelError::Config("checkpointing is disabled".into())),
        }
    }
}
