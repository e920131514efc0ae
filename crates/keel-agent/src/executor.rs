use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_core::config::EngineConfig;
use keel_core::error::{KeelError, Result};
use keel_core::event::EventBus;
use keel_core::state::SharedState;
use keel_core::traits::{ToolInvoker, WorkerContext, WorkerOutput};
use keel_core::types::{is_marked_degraded, KeelEvent, StageStatus, ThreadId};
use keel_memory::{CheckpointMetadata, Checkpointer};

use crate::plan::types::{
    segments, Degradation, ExecutionPlan, ExecutionResult, Stage, StageError, ValidatedPlan,
    VsEstimates,
};
use crate::registry::WorkerRegistry;

/// Final state of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Failed,
    Skipped,
}

/// Result of a run plus the state it left behind. Returned even when stages
/// failed, so callers can present partial results.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    pub state: SharedState,
}

struct StageRun<'a> {
    stage: &'a Stage,
    result: Result<WorkerOutput>,
    attempts: u32,
    duration_ms: u64,
}

/// Runs a validated plan level by level.
///
/// Within a level, contiguous parallel stages run concurrently up to
/// `max_concurrency`; all other stages run one at a time in `order`. Every
/// stage of a level reads the state as it was when the level started. Outputs
/// are merged in `order` once the whole level has settled.
pub struct PlanExecutor {
    workers: Arc<WorkerRegistry>,
    tools: Arc<dyn ToolInvoker>,
    max_concurrency: usize,
    default_stage_timeout_ms: u64,
    checkpoint_each_level: bool,
    event_bus: Option<Arc<EventBus>>,
    checkpointer: Option<Arc<Checkpointer>>,
}

impl PlanExecutor {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        tools: Arc<dyn ToolInvoker>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            workers,
            tools,
            max_concurrency: config.max_concurrency.max(1),
            default_stage_timeout_ms: config.default_stage_timeout_ms,
            checkpoint_each_level: config.checkpoint_each_level,
            event_bus: None,
            checkpointer: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    fn emit(&self, event: KeelEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Execute `plan` against `state`. Stage failures are recorded in the
    /// result, never returned as an error. With a thread id and a
    /// checkpointer, state is checkpointed after each level.
    pub async fn execute(
        &self,
        plan: &ValidatedPlan,
        state: SharedState,
        thread_id: Option<&ThreadId>,
    ) -> ExecutionOutcome {
        let plan = plan.plan();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(plan.context.timeout_ms);
        let cid = plan.context.correlation_id.clone();

        info!(
            plan_id = %plan.plan_id,
            correlation_id = %cid,
            stages = plan.stages.len(),
            "Plan execution started"
        );
        self.emit(KeelEvent::RunStarted {
            correlation_id: cid.clone(),
            plan_id: plan.plan_id.clone(),
            query_type: plan.query_type.clone(),
            stage_count: plan.stages.len(),
        });

        let mut state = state;
        let mut settled: HashMap<String, Settled> = HashMap::new();
        let mut errors: Vec<StageError> = Vec::new();
        let mut degradations: Vec<Degradation> = Vec::new();
        let mut actual_cost = 0.0;
        let mut timed_out = false;

        for (depth, level) in plan.levels().into_iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(
                    plan_id = %plan.plan_id,
                    level = depth,
                    timeout_ms = plan.context.timeout_ms,
                    "Plan timeout reached; skipping remaining stages"
                );
                timed_out = true;
                break;
            }

            let mut runnable: Vec<&Stage> = Vec::with_capacity(level.len());
            for stage in level {
                match blocking_dependency(plan, stage, &settled) {
                    Some(dep) => {
                        debug!(stage_id = %stage.stage_id, dependency = %dep, "Skipping stage");
                        self.settle_skipped(&cid, stage, &mut settled);
                    }
                    None => runnable.push(stage),
                }
            }

            let mut runs: Vec<StageRun<'_>> = Vec::with_capacity(runnable.len());
            for segment in segments(&runnable) {
                if segment.len() == 1 {
                    runs.push(self.run_stage(segment[0], &state, plan).await);
                } else {
                    let batch: Vec<StageRun<'_>> = stream::iter(
                        segment.iter().map(|&s| self.run_stage(s, &state, plan)),
                    )
                    .buffer_unordered(self.max_concurrency)
                    .collect()
                    .await;
                    runs.extend(batch);
                }
            }
            runs.sort_by(|a, b| {
                a.stage
                    .order
                    .cmp(&b.stage.order)
                    .then_with(|| a.stage.stage_id.cmp(&b.stage.stage_id))
            });

            let mut level_changed = false;
            for run in runs {
                let stage = run.stage;
                match run.result {
                    Ok(output) => {
                        actual_cost += output.cost_usd.unwrap_or(stage.estimated_cost_usd);
                        collect_degradations(stage, &output, &mut degradations);

                        let undeclared: Vec<&String> = output
                            .fields
                            .keys()
                            .filter(|k| !stage.provides.contains(k))
                            .collect();
                        if !undeclared.is_empty() {
                            warn!(
                                stage_id = %stage.stage_id,
                                keys = ?undeclared,
                                "Worker wrote keys it does not declare"
                            );
                        }

                        let keys = state.merge_fields(output.fields);
                        state.mark_agent_completed(&stage.agent_id);
                        settled.insert(stage.stage_id.clone(), Settled::Completed);
                        level_changed = true;

                        self.emit(KeelEvent::AgentExecution {
                            correlation_id: cid.clone(),
                            stage_id: stage.stage_id.clone(),
                            agent_id: stage.agent_id.clone(),
                            status: StageStatus::Completed,
                            attempt: run.attempts,
                            duration_ms: run.duration_ms,
                        });
                        self.emit(KeelEvent::StateChange {
                            correlation_id: cid.clone(),
                            stage_id: stage.stage_id.clone(),
                            keys,
                        });
                    }
                    Err(e) => {
                        error!(
                            stage_id = %stage.stage_id,
                            agent_id = %stage.agent_id,
                            attempts = run.attempts,
                            required = stage.required,
                            error = %e,
                            "Stage failed"
                        );
                        settled.insert(stage.stage_id.clone(), Settled::Failed);
                        errors.push(StageError {
                            stage_id: stage.stage_id.clone(),
                            error: e.to_string(),
                        });
                        self.emit(KeelEvent::AgentExecution {
                            correlation_id: cid.clone(),
                            stage_id: stage.stage_id.clone(),
                            agent_id: stage.agent_id.clone(),
                            status: StageStatus::Failed,
                            attempt: run.attempts,
                            duration_ms: run.duration_ms,
                        });
                        self.emit(KeelEvent::Error {
                            correlation_id: cid.clone(),
                            source: stage.stage_id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if self.checkpoint_each_level && level_changed {
                self.checkpoint(plan, &state, &settled, thread_id).await;
            }
        }

        // Anything not reached: overall timeout, or outside every level.
        for stage in &plan.stages {
            if !settled.contains_key(&stage.stage_id) {
                self.settle_skipped(&cid, stage, &mut settled);
            }
        }

        if !self.checkpoint_each_level {
            self.checkpoint(plan, &state, &settled, thread_id).await;
        }

        let by_status = |want: Settled| -> Vec<String> {
            plan.stages
                .iter()
                .filter(|s| settled.get(&s.stage_id) == Some(&want))
                .map(|s| s.stage_id.clone())
                .collect()
        };
        let required_failed = plan
            .stages
            .iter()
            .any(|s| s.required && settled.get(&s.stage_id) == Some(&Settled::Failed));
        let success = !timed_out && !required_failed;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = ExecutionResult {
            plan_id: plan.plan_id.clone(),
            success,
            stages_completed: by_status(Settled::Completed),
            stages_failed: by_status(Settled::Failed),
            stages_skipped: by_status(Settled::Skipped),
            duration_ms,
            errors,
            vs_estimates: vs_estimates(plan, duration_ms, actual_cost),
            timed_out,
            degradations,
        };

        info!(
            plan_id = %plan.plan_id,
            success,
            completed = result.stages_completed.len(),
            failed = result.stages_failed.len(),
            skipped = result.stages_skipped.len(),
            duration_ms,
            "Plan execution finished"
        );
        self.emit(KeelEvent::RunComplete {
            correlation_id: cid,
            plan_id: plan.plan_id.clone(),
            success,
            duration_ms,
        });

        ExecutionOutcome { result, state }
    }

    fn settle_skipped(&self, cid: &str, stage: &Stage, settled: &mut HashMap<String, Settled>) {
        settled.insert(stage.stage_id.clone(), Settled::Skipped);
        self.emit(KeelEvent::AgentExecution {
            correlation_id: cid.to_string(),
            stage_id: stage.stage_id.clone(),
            agent_id: stage.agent_id.clone(),
            status: StageStatus::Skipped,
            attempt: 0,
            duration_ms: 0,
        });
    }

    /// One stage with its timeout and retry policy. Only transient failures
    /// are retried; a timeout ends the stage.
    async fn run_stage<'a>(
        &self,
        stage: &'a Stage,
        state: &SharedState,
        plan: &ExecutionPlan,
    ) -> StageRun<'a> {
        let start = Instant::now();
        let cid = &plan.context.correlation_id;

        let Some(worker) = self.workers.get(&stage.agent_id) else {
            return StageRun {
                stage,
                result: Err(KeelError::UnknownWorker(stage.agent_id.clone())),
                attempts: 0,
                duration_ms: 0,
            };
        };

        let timeout_ms = match stage.max_execution_time_ms {
            0 => self.default_stage_timeout_ms,
            ms => ms,
        };
        let input = state.slice(&stage.requires);
        let mut attempt: u32 = 0;

        loop {
            self.emit(KeelEvent::AgentExecution {
                correlation_id: cid.clone(),
                stage_id: stage.stage_id.clone(),
                agent_id: stage.agent_id.clone(),
                status: StageStatus::Started,
                attempt: attempt + 1,
                duration_ms: 0,
            });

            let cancel = CancellationToken::new();
            let ctx = WorkerContext {
                correlation_id: cid.clone(),
                stage_id: stage.stage_id.clone(),
                query: plan.original_query.clone(),
                cancel: cancel.clone(),
                tools: self.tools.clone(),
            };

            let result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                worker.execute(input.clone(), ctx),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    cancel.cancel();
                    Err(KeelError::StageTimeout {
                        stage: stage.stage_id.clone(),
                        timeout_ms,
                    })
                }
            };

            match result {
                Err(e) if e.is_transient() && attempt < stage.retry.max_retries => {
                    let delay = stage.retry.delay(attempt);
                    warn!(
                        stage_id = %stage.stage_id,
                        attempt = attempt + 1,
                        max_retries = stage.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying stage"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => {
                    return StageRun {
                        stage,
                        result,
                        attempts: attempt + 1,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                }
            }
        }
    }

    /// Best-effort: a failed write is logged and the run continues in memory.
    async fn checkpoint(
        &self,
        plan: &ExecutionPlan,
        state: &SharedState,
        settled: &HashMap<String, Settled>,
        thread_id: Option<&ThreadId>,
    ) {
        let (Some(checkpointer), Some(thread_id)) = (&self.checkpointer, thread_id) else {
            return;
        };

        let completed: BTreeSet<String> = settled
            .iter()
            .filter(|(_, s)| **s == Settled::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        let metadata = CheckpointMetadata {
            plan_id: Some(plan.plan_id.clone()),
            correlation_id: Some(plan.context.correlation_id.clone()),
            completed_stages: completed.into_iter().collect(),
            ..Default::default()
        };

        let (succeeded, detail) = match checkpointer.save(thread_id, state, metadata).await {
            Ok(cp) => (true, format!("step {}", cp.step)),
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Checkpoint write failed; continuing in memory");
                (false, e.to_string())
            }
        };
        self.emit(KeelEvent::CheckpointOperation {
            correlation_id: plan.context.correlation_id.clone(),
            thread_id: thread_id.to_string(),
            operation: "save".into(),
            succeeded,
            detail: Some(detail),
        });
    }
}

/// The first required dependency that did not complete, if any.
fn blocking_dependency<'a>(
    plan: &ExecutionPlan,
    stage: &'a Stage,
    settled: &HashMap<String, Settled>,
) -> Option<&'a str> {
    stage
        .depends_on
        .iter()
        .find(|dep| {
            let hard = plan.stage(dep).map_or(true, |d| d.required);
            hard && matches!(
                settled.get(dep.as_str()),
                Some(Settled::Failed | Settled::Skipped) | None
            )
        })
        .map(String::as_str)
}

fn collect_degradations(stage: &Stage, output: &WorkerOutput, out: &mut Vec<Degradation>) {
    let marked = output
        .fields
        .values()
        .filter(|v| is_marked_degraded(v))
        .map(|v| {
            v.get("_degradation_reason")
                .and_then(|r| r.as_str())
                .unwrap_or("degraded")
                .to_string()
        });
    let declared = output.degradations.iter().map(|d| d.reason.clone());

    for reason in marked.chain(declared) {
        let entry = Degradation {
            stage_id: stage.stage_id.clone(),
            reason,
        };
        if !out.contains(&entry) {
            out.push(entry);
        }
    }
}

fn vs_estimates(plan: &ExecutionPlan, actual_duration_ms: u64, actual_cost_usd: f64) -> VsEstimates {
    let estimated = plan.estimates.duration_ms as f64;
    let actual = actual_duration_ms as f64;
    let accuracy = if estimated > 0.0 {
        (100.0 - (actual - estimated).abs() / estimated * 100.0).clamp(0.0, 100.0)
    } else if actual_duration_ms == 0 {
        100.0
    } else {
        0.0
    };
    VsEstimates {
        accuracy_percent: (accuracy * 100.0).round() / 100.0,
        cost_diff_usd: actual_cost_usd - plan.estimates.cost_usd,
        actual_cost_usd,
        actual_duration_ms,
    }
}
