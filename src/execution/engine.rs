//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow execution including:
//! - Cursor-driven step scheduling with branches and fallbacks
//! - Error policies, retries and critical-step aborts
//! - Execution timeouts bounding every dispatch
//! - Pause/resume/cancel via the execution registry
//! - Record persistence and lifecycle events

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use super::condition::{evaluate_all, ConditionError};
use super::context::{ExecutionContext, ExecutionOptions};
use super::dispatch::{ActionRegistry, DispatchOutcome, StepResult};
use super::mapper::{apply_output, resolve_input};
use super::policy::{decide, PolicyDecision};
use super::record::{ExecutionRecord, ExecutionStatus, StepExecutionRecord, StepStatus};
use super::registry::{ActiveExecution, ControlSignal, ExecutionRegistry};
use super::retry::{retry, RetryPolicy};
use super::scheduler::{Scheduler, StepOutcome};
use super::store::{ExecutionStore, MemoryStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::monitoring::{EventSink, ExecutionEvent, ExecutionEventKind, LogSink, ResourceMonitor};
use crate::workflow::model::{StepDefinition, StepType, WorkflowDefinition};
use crate::workflow::validator::validate_workflow;

/// Workflow execution engine.
///
/// Holds the registered workflows, the action handlers and the registry of
/// in-flight executions. Executions are plain futures: run several at once
/// by sharing the engine behind an [`Arc`].
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::execution::{ActionRegistry, Engine, ExecutionOptions};
/// use flowrunner::workflow::load_workflow;
/// use flowrunner::EngineConfig;
/// use serde_json::Map;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(EngineConfig::default(), ActionRegistry::with_builtins());
///     engine.register_workflow(load_workflow("reorder.yaml")?).await?;
///
///     let record = engine
///         .execute_workflow("reorder", Engine::generate_execution_id(), Map::new(), ExecutionOptions::default())
///         .await?;
///     println!("{} ({}%)", record.status, record.progress_percentage);
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    actions: Arc<ActionRegistry>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    registry: ExecutionRegistry,
    store: Arc<dyn ExecutionStore>,
    events: Arc<dyn EventSink>,
}

impl Engine {
    /// Creates an engine with an in-memory store that logs its events.
    pub fn new(config: EngineConfig, actions: ActionRegistry) -> Self {
        Self {
            config,
            actions: Arc::new(actions),
            workflows: RwLock::new(HashMap::new()),
            registry: ExecutionRegistry::new(),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(LogSink),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// A fresh random execution ID.
    pub fn generate_execution_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Validates and registers a workflow, replacing any previous version.
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        validate_workflow(&workflow)?;
        info!("Registered workflow '{}' ({} steps)", workflow.id, workflow.len());
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Runs a registered workflow to completion.
    ///
    /// # Returns
    ///
    /// * `Ok(record)` - The execution ran; its status says how it ended
    /// * `Err` - The execution could not start (unknown workflow,
    ///   concurrency limit, duplicate ID, store failure)
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        execution_id: impl Into<String>,
        input: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionRecord> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        self.run(workflow, execution_id.into(), input, options).await
    }

    /// Validates and runs a workflow that is not registered.
    pub async fn execute_definition(
        &self,
        workflow: WorkflowDefinition,
        execution_id: impl Into<String>,
        input: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionRecord> {
        validate_workflow(&workflow)?;
        self.run(Arc::new(workflow), execution_id.into(), input, options)
            .await
    }

    /// Suspends a running execution before its next step.
    pub async fn pause_execution(&self, execution_id: &str) -> Result<()> {
        self.registry.pause(execution_id).await
    }

    /// Continues a paused execution from where it stopped.
    pub async fn resume_execution(&self, execution_id: &str) -> Result<()> {
        self.registry.resume(execution_id).await
    }

    /// Stops an execution before its next step. A step already running is
    /// allowed to finish.
    pub async fn cancel_execution(&self, execution_id: &str, reason: Option<String>) -> Result<()> {
        self.registry.cancel(execution_id, reason).await
    }

    /// Status of an in-flight execution.
    pub async fn execution_status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.registry.status(execution_id).await
    }

    pub async fn active_executions(&self) -> Vec<ActiveExecution> {
        self.registry.active().await
    }

    /// Stored record of any execution, finished or not.
    pub async fn execution_record(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>> {
        Ok(self.store.get_execution(tenant_id, execution_id).await?)
    }

    pub async fn step_records(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>> {
        Ok(self.store.step_records(tenant_id, execution_id).await?)
    }

    fn concurrency_limit(&self, workflow: &WorkflowDefinition) -> usize {
        let fallback = if workflow.config.allow_concurrent_execution {
            self.config.default_max_concurrent_executions
        } else {
            1
        };
        workflow
            .config
            .max_concurrent_executions
            .unwrap_or(fallback)
            .max(1)
    }

    async fn run(
        &self,
        workflow: Arc<WorkflowDefinition>,
        execution_id: String,
        input: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionRecord> {
        let execution_timeout = options
            .timeout
            .or_else(|| workflow.config.execution_timeout.map(Duration::from_secs))
            .unwrap_or_else(|| self.config.default_timeout());

        let mut ctx = ExecutionContext::new(
            execution_id.clone(),
            workflow.id.clone(),
            &workflow.variables,
            input,
            &options,
            execution_timeout,
        );
        ctx.system.condition_semantics = self.config.condition_semantics;

        let control = self
            .registry
            .register(
                &execution_id,
                &workflow.id,
                &ctx.tenant_id,
                self.concurrency_limit(&workflow),
            )
            .await?;

        let mut record =
            ExecutionRecord::new(&ctx.tenant_id, &execution_id, &workflow.id, workflow.len());
        if let Err(e) = self.store.create_execution(&record).await {
            self.registry.unregister(&execution_id).await;
            return Err(e.into());
        }

        record.status = ExecutionStatus::Running;
        self.registry
            .set_status(&execution_id, ExecutionStatus::Running)
            .await;

        info!(
            "Starting execution '{}' of workflow '{}' ({} steps, timeout {:?}{})",
            execution_id,
            workflow.id,
            workflow.len(),
            execution_timeout,
            if ctx.is_dry_run() { ", dry run" } else { "" }
        );

        let mut run = Run {
            engine: self,
            scheduler: Scheduler::new(&workflow),
            workflow,
            ctx,
            record,
            control,
            monitor: ResourceMonitor::new(),
            attempts: 0,
            retries: 0,
        };
        run.sync_record().await;

        let ending = run.drive().await;
        Ok(run.finalize(ending).await)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default(), ActionRegistry::with_builtins())
    }
}

/// How an execution ended.
enum Ending {
    Completed,
    Aborted {
        status: ExecutionStatus,
        error: EngineError,
        step_id: Option<String>,
    },
}

/// What the loop does after a step.
enum Flow {
    Next,
    End(Ending),
}

/// Origin of a step failure.
enum Cause {
    Step,
    Condition(ConditionError),
}

/// A parallel sub-step after fan-out.
enum Branch {
    Skipped(StepDefinition),
    Ran {
        step: StepDefinition,
        input: Map<String, Value>,
        started_at: DateTime<Utc>,
        outcome: DispatchOutcome,
    },
}

fn failed(message: impl Into<String>, raised: bool) -> DispatchOutcome {
    DispatchOutcome {
        result: StepResult::failure(message),
        raised,
        duration: Duration::ZERO,
    }
}

/// State of one execution. Only this loop writes the execution record.
struct Run<'a> {
    engine: &'a Engine,
    workflow: Arc<WorkflowDefinition>,
    scheduler: Scheduler,
    ctx: ExecutionContext,
    record: ExecutionRecord,
    control: watch::Receiver<ControlSignal>,
    monitor: ResourceMonitor,
    attempts: u64,
    retries: u64,
}

impl Run<'_> {
    async fn drive(&mut self) -> Ending {
        loop {
            if let Some(ending) = self.checkpoint().await {
                return ending;
            }

            let Some(step) = self.scheduler.current().cloned() else {
                return Ending::Completed;
            };

            if self.ctx.system.is_timed_out() {
                return self.timed_out(None);
            }

            self.record.current_step_id = Some(step.id.clone());
            let flow = self.run_step(&step).await;
            self.sync_record().await;

            if let Flow::End(ending) = flow {
                return ending;
            }
        }
    }

    /// Observes the latest control signal; blocks while paused.
    async fn checkpoint(&mut self) -> Option<Ending> {
        let signal = self.control.borrow_and_update().clone();
        match signal {
            ControlSignal::Run => None,
            ControlSignal::Cancel(reason) => Some(Self::cancelled(reason)),
            ControlSignal::Pause => self.wait_while_paused().await,
        }
    }

    async fn wait_while_paused(&mut self) -> Option<Ending> {
        info!("Execution '{}' paused", self.ctx.execution_id);
        self.record.status = ExecutionStatus::Paused;
        self.sync_record().await;
        self.emit(ExecutionEventKind::Paused).await;

        loop {
            if self.control.changed().await.is_err() {
                // Registry dropped the entry: cancelled.
                let reason = match &*self.control.borrow() {
                    ControlSignal::Cancel(reason) => reason.clone(),
                    _ => None,
                };
                return Some(Self::cancelled(reason));
            }

            let signal = self.control.borrow_and_update().clone();
            match signal {
                ControlSignal::Pause => continue,
                ControlSignal::Cancel(reason) => return Some(Self::cancelled(reason)),
                ControlSignal::Run => break,
            }
        }

        self.record.status = ExecutionStatus::Running;
        self.sync_record().await;
        self.emit(ExecutionEventKind::Resumed).await;
        None
    }

    async fn run_step(&mut self, step: &StepDefinition) -> Flow {
        match evaluate_all(
            &step.execution_conditions,
            &self.ctx.data(),
            self.ctx.system.condition_semantics,
        ) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Step '{}' skipped: conditions not met", step.id);
                self.scheduler.record(&step.id, StepOutcome::Skipped);
                self.scheduler.advance();
                return Flow::Next;
            }
            Err(e) => {
                let outcome = failed(EngineError::ConditionEvaluation(e.clone()).to_string(), true);
                self.write_attempt(step, &Map::new(), Utc::now(), 0, &outcome)
                    .await;
                return self
                    .on_failure(step, &Map::new(), outcome, Cause::Condition(e))
                    .await;
            }
        }

        let input = match resolve_input(step, &self.ctx) {
            Ok(input) => input,
            Err(e) => {
                let outcome = failed(e.to_string(), false);
                self.write_attempt(step, &Map::new(), Utc::now(), 0, &outcome)
                    .await;
                return self.on_failure(step, &Map::new(), outcome, Cause::Step).await;
            }
        };

        let Some(remaining) = self.ctx.system.remaining() else {
            return Flow::End(self.timed_out(Some(step.id.clone())));
        };

        debug!("Executing step '{}' ({})", step.label(), step.step_type);
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = if step.step_type == StepType::Parallel {
            let branches = timeout(
                remaining,
                fan_out(&self.engine.actions, step, &self.scheduler, &self.ctx),
            )
            .await;
            match branches {
                Ok(branches) => self.settle_branches(step, branches, start.elapsed()).await,
                Err(_) => return self.interrupted(step, &input, started_at, start).await,
            }
        } else {
            let dispatched = timeout(
                remaining,
                self.engine.actions.dispatch(step, &input, &self.ctx),
            )
            .await;
            match dispatched {
                Ok(outcome) => outcome,
                Err(_) => return self.interrupted(step, &input, started_at, start).await,
            }
        };

        self.write_attempt(step, &input, started_at, 0, &outcome).await;

        if outcome.succeeded() {
            self.on_success(step, outcome).await
        } else {
            self.on_failure(step, &input, outcome, Cause::Step).await
        }
    }

    async fn on_success(&mut self, step: &StepDefinition, outcome: DispatchOutcome) -> Flow {
        debug!("Step '{}' completed in {:?}", step.id, outcome.duration);

        // Parallel sub-steps already wrote their own outputs.
        if step.step_type != StepType::Parallel {
            apply_output(step, &outcome.result.data, &mut self.ctx);
        }
        self.scheduler.record(&step.id, StepOutcome::Completed);

        if outcome.result.skip_remaining_steps {
            info!("Step '{}' requested skipping the remaining steps", step.id);
            self.scheduler.stop();
            return Flow::End(Ending::Completed);
        }

        if step.step_type == StepType::Condition {
            let branch = outcome
                .result
                .data
                .get("result")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let (on_true, on_false) = step.branch_targets();
            let target = if branch { on_true } else { on_false };

            debug!("Condition '{}' evaluated to {}", step.id, branch);
            match target {
                Some(target) => self.jump(step, target),
                None => self.scheduler.advance(),
            }
            return Flow::Next;
        }

        match outcome.result.next_step_id.as_deref() {
            Some(target) => self.jump(step, target),
            None => self.scheduler.advance(),
        }
        Flow::Next
    }

    async fn on_failure(
        &mut self,
        step: &StepDefinition,
        input: &Map<String, Value>,
        outcome: DispatchOutcome,
        cause: Cause,
    ) -> Flow {
        warn!(
            "Step '{}' failed{}: {}",
            step.id,
            if outcome.raised { " (raised)" } else { "" },
            outcome.result.error_message()
        );

        let decision = decide(step, &outcome, self.workflow.config.on_error, &self.scheduler);
        match (decision, cause) {
            (PolicyDecision::Abort { message }, cause) => {
                self.scheduler.record(&step.id, StepOutcome::Failed);
                Flow::End(Self::aborted(step, message, cause))
            }
            // Re-evaluating the same conditions against the same data cannot change the result.
            (PolicyDecision::Retry, cause @ Cause::Condition(_)) => {
                self.scheduler.record(&step.id, StepOutcome::Failed);
                Flow::End(Self::aborted(step, outcome.result.error_message(), cause))
            }
            (PolicyDecision::Retry, Cause::Step) => self.retry_step(step, input, outcome).await,
            (PolicyDecision::Advance, _) => {
                self.scheduler.record(&step.id, StepOutcome::Failed);
                self.scheduler.advance();
                Flow::Next
            }
            (PolicyDecision::Skip, _) => {
                self.scheduler.record(&step.id, StepOutcome::Skipped);
                self.scheduler.advance();
                Flow::Next
            }
            (PolicyDecision::Jump(position), _) => {
                self.scheduler.record(&step.id, StepOutcome::Failed);
                self.scheduler.jump_to(position);
                Flow::Next
            }
        }
    }

    async fn retry_step(
        &mut self,
        step: &StepDefinition,
        input: &Map<String, Value>,
        first: DispatchOutcome,
    ) -> Flow {
        let policy = RetryPolicy::for_step(step, &self.engine.config);
        let Some(remaining) = self.ctx.system.remaining() else {
            self.scheduler.record(&step.id, StepOutcome::Failed);
            return Flow::End(self.timed_out(Some(step.id.clone())));
        };

        let mut attempts = Vec::new();
        let retried = timeout(
            remaining,
            retry(
                &self.engine.actions,
                step,
                input,
                &self.ctx,
                &policy,
                &first,
                &mut attempts,
            ),
        )
        .await;

        for attempt in &attempts {
            self.retries += 1;
            self.write_attempt(step, input, attempt.started_at, attempt.number, &attempt.outcome)
                .await;
        }

        match retried {
            Ok(outcome) if outcome.succeeded() => self.on_success(step, outcome).await,
            Ok(outcome) => {
                self.scheduler.record(&step.id, StepOutcome::Failed);
                Flow::End(Self::aborted(step, outcome.result.error_message(), Cause::Step))
            }
            Err(_) => {
                warn!("Execution timed out while retrying step '{}'", step.id);
                self.scheduler.record(&step.id, StepOutcome::Failed);
                Flow::End(self.timed_out(Some(step.id.clone())))
            }
        }
    }

    /// Writes the record of a step cut short by the execution timeout.
    async fn interrupted(
        &mut self,
        step: &StepDefinition,
        input: &Map<String, Value>,
        started_at: DateTime<Utc>,
        start: Instant,
    ) -> Flow {
        warn!("Execution timed out during step '{}'", step.id);
        let mut outcome = failed("interrupted by execution timeout", false);
        outcome.duration = start.elapsed();

        self.write_attempt(step, input, started_at, 0, &outcome).await;
        self.scheduler.record(&step.id, StepOutcome::Failed);
        Flow::End(self.timed_out(Some(step.id.clone())))
    }

    async fn settle_branches(
        &mut self,
        parent: &StepDefinition,
        branches: Vec<Branch>,
        duration: Duration,
    ) -> DispatchOutcome {
        let mut data = Map::new();
        let mut failures = Vec::new();
        let mut raised = false;

        for branch in branches {
            match branch {
                Branch::Skipped(step) => {
                    self.scheduler.record(&step.id, StepOutcome::Skipped);
                }
                Branch::Ran {
                    step,
                    input,
                    started_at,
                    outcome,
                } => {
                    self.write_attempt(&step, &input, started_at, 0, &outcome)
                        .await;
                    if outcome.succeeded() {
                        apply_output(&step, &outcome.result.data, &mut self.ctx);
                        self.scheduler.record(&step.id, StepOutcome::Completed);
                    } else {
                        raised |= outcome.raised;
                        failures.push(format!("{}: {}", step.id, outcome.result.error_message()));
                        self.scheduler.record(&step.id, StepOutcome::Failed);
                    }
                    data.insert(step.id, Value::Object(outcome.result.data));
                }
            }
        }

        let result = if failures.is_empty() {
            StepResult::success()
        } else {
            StepResult::failure(format!(
                "parallel step '{}' failed: {}",
                parent.id,
                failures.join("; ")
            ))
        };

        DispatchOutcome {
            result: result.with_data(data),
            raised,
            duration,
        }
    }

    fn jump(&mut self, step: &StepDefinition, target: &str) {
        match self.scheduler.position_of(target) {
            Some(_) if self.scheduler.is_owned(target) => {
                warn!(
                    "Step '{}' routes to '{}', which runs only inside a parallel step; continuing",
                    step.id, target
                );
                self.scheduler.advance();
            }
            Some(position) => {
                debug!("Step '{}' routes to '{}'", step.id, target);
                self.scheduler.jump_to(position);
            }
            None => {
                warn!("Step '{}' routes to unknown step '{}'; continuing", step.id, target);
                self.scheduler.advance();
            }
        }
    }

    async fn write_attempt(
        &mut self,
        step: &StepDefinition,
        input: &Map<String, Value>,
        started_at: DateTime<Utc>,
        retry_count: u32,
        outcome: &DispatchOutcome,
    ) {
        self.attempts += 1;
        let resource_usage = outcome
            .result
            .resource_usage
            .or_else(|| self.monitor.sample());

        let record = StepExecutionRecord {
            tenant_id: self.ctx.tenant_id.clone(),
            execution_id: self.ctx.execution_id.clone(),
            step_id: step.id.clone(),
            step_type: step.step_type.clone(),
            status: if outcome.succeeded() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            retry_count,
            started_at,
            completed_at: Utc::now(),
            duration_ms: outcome.duration.as_millis() as u64,
            input: input.clone(),
            output: outcome.result.data.clone(),
            error_message: (!outcome.succeeded()).then(|| outcome.result.error_message()),
            raised: outcome.raised,
            resource_usage,
        };

        if let Err(e) = self.engine.store.append_step(&record).await {
            warn!("Failed to store record of step '{}': {}", step.id, e);
        }
    }

    /// Copies the scheduler's tallies onto the record and persists it.
    async fn sync_record(&mut self) {
        let counts = self.scheduler.counts();
        self.record.completed_steps = counts.completed;
        self.record.failed_steps = counts.failed;
        self.record.skipped_steps = counts.skipped;
        self.record.progress_percentage = self.scheduler.progress();
        self.record.updated_at = Utc::now();

        if let Err(e) = self.engine.store.update_execution(&self.record).await {
            warn!(
                "Failed to store progress of execution '{}': {}",
                self.record.execution_id, e
            );
        }
    }

    async fn emit(&self, kind: ExecutionEventKind) {
        self.engine
            .events
            .emit(ExecutionEvent::new(kind, &self.record))
            .await;
    }

    async fn finalize(mut self, ending: Ending) -> ExecutionRecord {
        self.engine.registry.unregister(&self.ctx.execution_id).await;

        let status = match &ending {
            Ending::Completed => ExecutionStatus::Completed,
            Ending::Aborted { status, .. } => *status,
        };

        if status != ExecutionStatus::Cancelled {
            self.scheduler.finish();
        }

        self.record.output = self.ctx.execution_data.clone();
        self.record.metrics.insert("attempts".into(), json!(self.attempts));
        self.record.metrics.insert("retries".into(), json!(self.retries));
        self.record
            .metrics
            .insert("peakMemoryMb".into(), json!(self.monitor.peak_memory_mb()));
        self.record
            .metrics
            .insert("averageCpu".into(), json!(self.monitor.average_cpu()));

        if let Ending::Aborted { error, step_id, .. } = &ending {
            self.record
                .set_error(error.code(), error.to_string(), step_id.clone());
        }
        self.record.finish(status);
        self.sync_record().await;

        match &ending {
            Ending::Completed => info!(
                "Execution '{}' completed: {} completed, {} failed, {} skipped",
                self.record.execution_id,
                self.record.completed_steps,
                self.record.failed_steps,
                self.record.skipped_steps
            ),
            Ending::Aborted { error, .. } => error!(
                "Execution '{}' ended {}: {}",
                self.record.execution_id, status, error
            ),
        }

        if let Some(kind) = ExecutionEventKind::for_terminal(status) {
            self.emit(kind).await;
        }
        self.record
    }

    fn timed_out(&self, step_id: Option<String>) -> Ending {
        Ending::Aborted {
            status: ExecutionStatus::Timeout,
            error: EngineError::Timeout(self.ctx.system.timeout),
            step_id,
        }
    }

    fn cancelled(reason: Option<String>) -> Ending {
        Ending::Aborted {
            status: ExecutionStatus::Cancelled,
            error: EngineError::Cancelled(reason),
            step_id: None,
        }
    }

    fn aborted(step: &StepDefinition, message: String, cause: Cause) -> Ending {
        let error = match cause {
            Cause::Condition(e) => EngineError::ConditionEvaluation(e),
            Cause::Step => EngineError::StepExecution {
                step_id: step.id.clone(),
                message,
            },
        };
        Ending::Aborted {
            status: ExecutionStatus::Failed,
            error,
            step_id: Some(step.id.clone()),
        }
    }
}

/// Runs a parallel step's sub-steps concurrently against one context snapshot.
async fn fan_out(
    actions: &ActionRegistry,
    parent: &StepDefinition,
    scheduler: &Scheduler,
    ctx: &ExecutionContext,
) -> Vec<Branch> {
    let steps: Vec<StepDefinition> = parent
        .parallel_step_ids()
        .into_iter()
        .filter_map(|id| {
            let step = scheduler.step(id).cloned();
            if step.is_none() {
                warn!("Parallel step '{}' references unknown step '{}'", parent.id, id);
            }
            step
        })
        .collect();

    debug!("Parallel step '{}' fanning out {} sub-steps", parent.id, steps.len());
    join_all(steps.into_iter().map(|step| run_branch(actions, step, ctx))).await
}

async fn run_branch(actions: &ActionRegistry, step: StepDefinition, ctx: &ExecutionContext) -> Branch {
    if !step.is_active {
        return Branch::Skipped(step);
    }

    match evaluate_all(&step.execution_conditions, &ctx.data(), ctx.system.condition_semantics) {
        Ok(true) => {}
        Ok(false) => return Branch::Skipped(step),
        Err(e) => {
            return Branch::Ran {
                step,
                input: Map::new(),
                started_at: Utc::now(),
                outcome: failed(EngineError::ConditionEvaluation(e).to_string(), true),
            }
        }
    }

    let started_at = Utc::now();
    let (input, outcome) = match resolve_input(&step, ctx) {
        Ok(input) => {
            let outcome = actions.dispatch(&step, &input, ctx).await;
            (input, outcome)
        }
        Err(e) => (Map::new(), failed(e.to_string(), false)),
    };

    Branch::Ran {
        step,
        input,
        started_at,
        outcome,
    }
}
