//! Run coordinator: single-writer, batch-synchronous scheduling.
//!
//! Stage tasks are spawned per batch and report `StageEvent`s over an mpsc
//! channel; the coordinator loop is the only writer of `RunState`, so no
//! locks guard shared state. Batches advance when every member is terminal
//! or suspended -- a stage waiting on approval suspends only its own
//! downstream subgraph, never sibling branches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stageflow_types::run::{RunState, RunStatus, StageStatus};
use stageflow_types::workflow::{OnFailure, ParameterSpec, StageDefinition, WorkflowDefinition};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::expr::template;
use crate::ports::{
    ApprovalSink, CapabilityRegistry, ContextBlock, ContextError, ContextProvider, HookEvent,
    HookSink,
};

use super::context::RunContext;
use super::events::{RunEvent, RunEventBus};
use super::executor::{self, StageEvent, StageExecutor, StageRun};
use super::graph::StageGraph;
use super::hooks::HookDispatcher;
use super::loader::{self, SchemaError};
use super::retry;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default run-wide timeout (1 hour).
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Default bound on concurrently executing capability dispatches.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 8;

// ---------------------------------------------------------------------------
// Error and report types
// ---------------------------------------------------------------------------

/// Pre-run failures. Once a run starts, stage failures are recorded in the
/// `RunState` rather than surfaced as errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("parameter '{name}': {message}")]
    Parameter { name: String, message: String },

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Result of a finished run: the final state plus the stage output map.
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    /// Stage id -> resolved outputs, for downstream consumers.
    pub outputs: HashMap<String, HashMap<String, Value>>,
}

/// Result of a dry run: scheduling plus resolution previews, no dispatch.
#[derive(Debug)]
pub struct DryRunReport {
    pub batches: Vec<Vec<String>>,
    pub stages: Vec<StagePreview>,
}

/// Per-stage preview of condition and input resolution.
#[derive(Debug)]
pub struct StagePreview {
    pub stage_id: String,
    /// Condition value, or the evaluation error. `None` when unconditional.
    pub condition: Option<Result<Value, String>>,
    /// Input name -> resolved value or evaluation error.
    pub inputs: HashMap<String, Result<Value, String>>,
}

// ---------------------------------------------------------------------------
// RunCoordinator
// ---------------------------------------------------------------------------

/// Owns run lifecycles: parameter binding, batch scheduling, state, events,
/// hooks, and cancellation.
pub struct RunCoordinator {
    executor: Arc<StageExecutor>,
    contexts: Arc<dyn ContextProvider>,
    hooks: HookDispatcher,
    events: RunEventBus,
    cancellations: DashMap<Uuid, CancellationToken>,
    concurrency_limit: usize,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        approvals: Arc<dyn ApprovalSink>,
        contexts: Arc<dyn ContextProvider>,
        hook_sink: Arc<dyn HookSink>,
    ) -> Self {
        Self {
            executor: Arc::new(StageExecutor::new(registry, approvals, contexts.clone())),
            contexts,
            hooks: HookDispatcher::new(hook_sink),
            events: RunEventBus::default(),
            cancellations: DashMap::new(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
        }
    }

    /// Override the capability-dispatch concurrency bound.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// The bus carrying run and stage status transitions.
    pub fn events(&self) -> &RunEventBus {
        &self.events
    }

    /// Cooperatively cancel a running workflow. Returns `false` when the run
    /// is unknown or already finished.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellations.get(&run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling workflow run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Run entry points
    // -----------------------------------------------------------------------

    /// Execute a workflow to a terminal run state.
    ///
    /// Validation, parameter binding, and workflow-level context resolution
    /// failures block the start and surface as `CoordinatorError`; stage
    /// failures afterwards are recorded in the returned `RunState`.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        bindings: HashMap<String, Value>,
    ) -> Result<RunReport, CoordinatorError> {
        loader::validate_definition(definition)?;
        let parameters = bind_parameters(&definition.config.parameters, bindings)?;
        let graph = StageGraph::build(&definition.stages)?;
        let batches = graph.batches()?;

        let base_blocks = match &definition.context {
            Some(policy) => {
                self.contexts
                    .resolve(&policy.modules, policy.memory.as_ref())
                    .await?
            }
            None => Vec::new(),
        };

        let mut state = RunState::new(
            &definition.workflow.id,
            &definition.workflow.name,
            parameters.clone(),
            definition.stages.iter().map(|s| s.id.clone()),
        );
        state.status = RunStatus::Running;
        let run_id = state.id;

        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());

        let mut run_ctx = RunContext::new(
            &definition.workflow.id,
            &definition.workflow.name,
            &definition.workflow.version,
            run_id,
            parameters,
            definition.config.env.clone(),
        );
        run_ctx.set_context_blocks(base_blocks.clone());

        tracing::info!(
            run_id = %run_id,
            workflow = definition.workflow.id.as_str(),
            stages = definition.stages.len(),
            batches = batches.len(),
            "starting workflow run"
        );
        self.events.publish(RunEvent::RunStarted {
            run_id,
            workflow_id: definition.workflow.id.clone(),
        });

        if let Some(hooks) = &definition.hooks {
            self.hooks
                .dispatch(HookEvent::Start, &hooks.on_start, &run_ctx.to_expression_context())
                .await;
        }

        let run_timeout = Duration::from_secs(
            definition
                .config
                .timeout_secs
                .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
        );
        let timed_out = tokio::time::timeout(
            run_timeout,
            self.drive(
                definition,
                &graph,
                &batches,
                &mut state,
                &mut run_ctx,
                &base_blocks,
                &cancel,
            ),
        )
        .await
        .is_err();

        self.cancellations.remove(&run_id);

        if timed_out {
            // The global timeout escalates to a run-level halt.
            cancel.cancel();
            self.cancel_remaining(&mut state, &mut run_ctx);
            state.status = RunStatus::Halted;
            state.error = Some(format!("run exceeded {}s timeout", run_timeout.as_secs()));
            tracing::warn!(run_id = %run_id, "workflow run timed out");
        } else if state.status == RunStatus::Running {
            if cancel.is_cancelled() {
                state.status = RunStatus::Cancelled;
                state.error = Some("run cancelled".to_string());
            } else if state.overall_success() {
                state.status = RunStatus::Succeeded;
            } else {
                state.status = RunStatus::Failed;
                if state.error.is_none() {
                    state.error = Some("one or more stages failed".to_string());
                }
            }
        }
        state.completed_at = Some(Utc::now());

        self.events.publish(RunEvent::RunFinished {
            run_id,
            status: state.status,
        });

        if let Some(hooks) = &definition.hooks {
            let final_context = run_ctx.to_expression_context();
            match state.status {
                RunStatus::Succeeded => {
                    self.hooks
                        .dispatch(HookEvent::Complete, &hooks.on_complete, &final_context)
                        .await
                }
                RunStatus::Failed | RunStatus::Halted | RunStatus::Cancelled => {
                    self.hooks
                        .dispatch(HookEvent::Failure, &hooks.on_failure, &final_context)
                        .await
                }
                RunStatus::Pending | RunStatus::Running => {}
            }
        }

        tracing::info!(run_id = %run_id, status = ?state.status, "workflow run finished");
        let outputs = state.outputs();
        Ok(RunReport { state, outputs })
    }

    /// Validate, batch, and preview expression resolution without dispatching
    /// any stage or firing any hook.
    pub async fn dry_run(
        &self,
        definition: &WorkflowDefinition,
        bindings: HashMap<String, Value>,
    ) -> Result<DryRunReport, CoordinatorError> {
        loader::validate_definition(definition)?;
        let parameters = bind_parameters(&definition.config.parameters, bindings)?;
        let batches = StageGraph::build(&definition.stages)?.batches()?;

        let mut run_ctx = RunContext::new(
            &definition.workflow.id,
            &definition.workflow.name,
            &definition.workflow.version,
            Uuid::now_v7(),
            parameters,
            definition.config.env.clone(),
        );
        // Seed each stage with its declared defaults so cross-stage previews
        // resolve the way a skipped stage would.
        for stage in &definition.stages {
            run_ctx.record_stage(
                &stage.id,
                StageStatus::Pending,
                &executor::default_outputs(stage),
            );
        }
        let snapshot = run_ctx.to_expression_context();

        let stages = definition
            .stages
            .iter()
            .map(|stage| StagePreview {
                stage_id: stage.id.clone(),
                condition: stage.condition.as_ref().map(|condition| {
                    template::evaluate_source(condition, &snapshot).map_err(|e| e.to_string())
                }),
                inputs: stage
                    .inputs
                    .iter()
                    .map(|(name, decl)| {
                        (
                            name.clone(),
                            template::evaluate_source(&decl.source, &snapshot)
                                .map_err(|e| e.to_string()),
                        )
                    })
                    .collect(),
            })
            .collect();

        Ok(DryRunReport { batches, stages })
    }

    // -----------------------------------------------------------------------
    // Batch loop
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &StageGraph,
        batches: &[Vec<String>],
        state: &mut RunState,
        run_ctx: &mut RunContext,
        base_blocks: &[ContextBlock],
        cancel: &CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::channel::<StageEvent>(64);
        let mut scheduler = BatchScheduler {
            coordinator: self,
            definition,
            graph,
            stage_index: definition
                .stages
                .iter()
                .map(|s| (s.id.as_str(), s))
                .collect(),
            base_blocks,
            limiter: Arc::new(Semaphore::new(self.concurrency_limit)),
            cancel: cancel.clone(),
            tx,
            suspended: HashSet::new(),
            deferred: Vec::new(),
            in_flight: HashSet::new(),
            halted: false,
        };

        'batches: for (batch_index, batch) in batches.iter().enumerate() {
            if scheduler.halted || cancel.is_cancelled() {
                break;
            }
            state.current_batch = batch_index;
            tracing::debug!(
                run_id = %state.id,
                batch = batch_index,
                stages = batch.len(),
                "processing batch"
            );

            for stage_id in batch {
                if state
                    .stage_status(stage_id)
                    .is_some_and(|s| s.is_terminal())
                {
                    continue; // pre-resolved, e.g. skipped as a dependent
                }
                if scheduler.blocked_by_suspension(stage_id) {
                    tracing::debug!(
                        stage_id = stage_id.as_str(),
                        "deferring stage behind a waiting approval"
                    );
                    scheduler.deferred.push(stage_id.clone());
                    continue;
                }
                scheduler.dispatch(stage_id, state, run_ctx);
            }

            while !scheduler.halted
                && !cancel.is_cancelled()
                && !scheduler.batch_settled(batch, state)
            {
                let Some(event) = rx.recv().await else {
                    break 'batches;
                };
                scheduler.handle_event(event, state, run_ctx);
            }
        }

        // Drain: waiting gates resolve and deferred stages dispatch as their
        // dependencies reach terminal statuses.
        while !scheduler.halted && !cancel.is_cancelled() && !scheduler.in_flight.is_empty() {
            let Some(event) = rx.recv().await else {
                break;
            };
            scheduler.handle_event(event, state, run_ctx);
        }

        // Let in-flight tasks observe the halt/cancel and report in, so their
        // attempt counts land in the state; refused transitions are no-ops.
        if (scheduler.halted || cancel.is_cancelled()) && !scheduler.in_flight.is_empty() {
            cancel.cancel();
            while !scheduler.in_flight.is_empty() {
                let Some(event) = rx.recv().await else {
                    break;
                };
                scheduler.handle_event(event, state, run_ctx);
            }
        }

        if scheduler.halted || cancel.is_cancelled() {
            self.cancel_remaining(state, run_ctx);
        }
    }

    /// Mark every non-terminal stage `Cancelled`.
    fn cancel_remaining(&self, state: &mut RunState, run_ctx: &mut RunContext) {
        let pending: Vec<String> = state
            .stages
            .iter()
            .filter(|(_, record)| !record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for stage_id in pending {
            if state.set_stage_status(&stage_id, StageStatus::Cancelled) {
                run_ctx.record_stage(&stage_id, StageStatus::Cancelled, &HashMap::new());
                self.events.publish(RunEvent::StageTransition {
                    run_id: state.id,
                    stage_id,
                    status: StageStatus::Cancelled,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BatchScheduler (per-run bookkeeping)
// ---------------------------------------------------------------------------

/// Mutable scheduling bookkeeping for one run's batch loop.
struct BatchScheduler<'a> {
    coordinator: &'a RunCoordinator,
    definition: &'a WorkflowDefinition,
    graph: &'a StageGraph,
    stage_index: HashMap<&'a str, &'a StageDefinition>,
    base_blocks: &'a [ContextBlock],
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<StageEvent>,
    /// Stages currently in `WaitingApproval`.
    suspended: HashSet<String>,
    /// Stages whose batch has passed but which wait behind a suspension.
    deferred: Vec<String>,
    /// Stages dispatched and not yet finished (includes waiting gates).
    in_flight: HashSet<String>,
    halted: bool,
}

impl BatchScheduler<'_> {
    /// A stage is blocked when any direct dependency is suspended or itself
    /// deferred behind a suspension.
    fn blocked_by_suspension(&self, stage_id: &str) -> bool {
        let Some(stage) = self.stage_index.get(stage_id) else {
            return false;
        };
        stage
            .depends_on
            .iter()
            .any(|dep| self.suspended.contains(dep) || self.deferred.iter().any(|d| d == dep))
    }

    /// Every direct dependency has reached a terminal status.
    fn deps_terminal(&self, stage_id: &str, state: &RunState) -> bool {
        let Some(stage) = self.stage_index.get(stage_id) else {
            return false;
        };
        stage.depends_on.iter().all(|dep| {
            state
                .stage_status(dep)
                .is_some_and(|status| status.is_terminal())
        })
    }

    /// The batch may be left behind when every member is terminal, waiting
    /// on approval, or parked in the deferred queue.
    fn batch_settled(&self, batch: &[String], state: &RunState) -> bool {
        batch.iter().all(|stage_id| {
            state
                .stage_status(stage_id)
                .is_some_and(|status| status.is_terminal())
                || self.suspended.contains(stage_id)
                || self.deferred.iter().any(|d| d == stage_id)
        })
    }

    /// Spawn one stage task with a fresh context snapshot.
    fn dispatch(&mut self, stage_id: &str, state: &RunState, run_ctx: &RunContext) {
        let Some(stage) = self.stage_index.get(stage_id) else {
            return;
        };
        let stage_run = StageRun {
            run_id: state.id,
            stage: (*stage).clone(),
            policy: retry::effective_policy(
                &self.definition.error_policy,
                stage.error_policy.as_ref(),
            ),
            snapshot: run_ctx.to_expression_context(),
            base_blocks: self.base_blocks.to_vec(),
            limiter: self.limiter.clone(),
            cancel: self.cancel.clone(),
        };
        self.in_flight.insert(stage_id.to_string());

        let executor = self.coordinator.executor.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            executor.execute(stage_run, tx).await;
        });
    }

    /// Apply one stage event. The only place `RunState` is mutated while
    /// stages are in flight.
    fn handle_event(&mut self, event: StageEvent, state: &mut RunState, run_ctx: &mut RunContext) {
        match event {
            StageEvent::Started { stage_id } => {
                if state.set_stage_status(&stage_id, StageStatus::Running) {
                    self.publish_transition(state.id, &stage_id, StageStatus::Running);
                }
            }
            StageEvent::Suspended { stage_id } => {
                if state.set_stage_status(&stage_id, StageStatus::WaitingApproval) {
                    self.suspended.insert(stage_id.clone());
                    self.publish_transition(state.id, &stage_id, StageStatus::WaitingApproval);
                }
            }
            StageEvent::Finished(outcome) => {
                self.in_flight.remove(&outcome.stage_id);
                self.suspended.remove(&outcome.stage_id);

                let applied = state.set_stage_status(&outcome.stage_id, outcome.status);
                if applied {
                    if let Some(record) = state.stages.get_mut(&outcome.stage_id) {
                        record.outputs = outcome.outputs.clone();
                        record.attempts = outcome.attempts;
                        record.failure = outcome.failure.clone();
                    }
                    run_ctx.record_stage(&outcome.stage_id, outcome.status, &outcome.outputs);
                    self.publish_transition(state.id, &outcome.stage_id, outcome.status);
                }

                if applied && outcome.status == StageStatus::Failed {
                    self.apply_failure_directive(&outcome, state, run_ctx);
                }

                if !self.halted && !self.cancel.is_cancelled() {
                    self.dispatch_ready_deferred(state, run_ctx);
                }
            }
        }
    }

    fn apply_failure_directive(
        &mut self,
        outcome: &executor::StageOutcome,
        state: &mut RunState,
        run_ctx: &mut RunContext,
    ) {
        let halt = outcome.force_halt || outcome.directive == Some(OnFailure::Halt);
        if halt {
            tracing::warn!(
                run_id = %state.id,
                stage_id = outcome.stage_id.as_str(),
                "stage failure halts the run"
            );
            self.halted = true;
            state.status = RunStatus::Halted;
            state.halted_by = Some(outcome.stage_id.clone());
            state.error = outcome.failure.as_ref().map(|f| f.to_string());
            self.cancel.cancel();
            return;
        }

        if outcome.directive == Some(OnFailure::SkipDependents) {
            let mut dependents: Vec<String> =
                self.graph.downstream_of(&outcome.stage_id).into_iter().collect();
            dependents.sort();
            for dependent in dependents {
                if state.stage_status(&dependent) != Some(StageStatus::Pending)
                    || self.in_flight.contains(&dependent)
                {
                    continue;
                }
                if state.set_stage_status(&dependent, StageStatus::Skipped) {
                    let outputs = self
                        .stage_index
                        .get(dependent.as_str())
                        .map(|stage| executor::default_outputs(stage))
                        .unwrap_or_default();
                    if let Some(record) = state.stages.get_mut(&dependent) {
                        record.outputs = outputs.clone();
                    }
                    run_ctx.record_stage(&dependent, StageStatus::Skipped, &outputs);
                    self.deferred.retain(|d| d != &dependent);
                    self.publish_transition(state.id, &dependent, StageStatus::Skipped);
                    tracing::debug!(
                        stage_id = dependent.as_str(),
                        failed = outcome.stage_id.as_str(),
                        "skipping dependent of failed stage"
                    );
                }
            }
        }
    }

    /// Dispatch deferred stages whose dependencies have all settled.
    fn dispatch_ready_deferred(&mut self, state: &mut RunState, run_ctx: &mut RunContext) {
        let ready: Vec<String> = self
            .deferred
            .iter()
            .filter(|stage_id| self.deps_terminal(stage_id, state))
            .cloned()
            .collect();
        for stage_id in ready {
            self.deferred.retain(|d| d != &stage_id);
            tracing::debug!(stage_id = stage_id.as_str(), "dispatching deferred stage");
            self.dispatch(&stage_id, state, run_ctx);
        }
    }

    fn publish_transition(&self, run_id: Uuid, stage_id: &str, status: StageStatus) {
        self.coordinator.events.publish(RunEvent::StageTransition {
            run_id,
            stage_id: stage_id.to_string(),
            status,
        });
    }
}

// ---------------------------------------------------------------------------
// Parameter binding
// ---------------------------------------------------------------------------

/// Validate bindings against the parameter schema and apply defaults.
fn bind_parameters(
    specs: &HashMap<String, ParameterSpec>,
    bindings: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, CoordinatorError> {
    for name in bindings.keys() {
        if !specs.contains_key(name) {
            return Err(CoordinatorError::Parameter {
                name: name.clone(),
                message: "not declared by the workflow".to_string(),
            });
        }
    }

    let mut bound = HashMap::new();
    for (name, spec) in specs {
        match bindings.get(name) {
            Some(value) => {
                if !spec.param_type.accepts(value) {
                    return Err(CoordinatorError::Parameter {
                        name: name.clone(),
                        message: format!(
                            "binding does not match declared type '{}'",
                            spec.param_type.as_str()
                        ),
                    });
                }
                bound.insert(name.clone(), value.clone());
            }
            None => {
                if let Some(default) = &spec.default {
                    bound.insert(name.clone(), default.clone());
                } else if spec.required {
                    return Err(CoordinatorError::Parameter {
                        name: name.clone(),
                        message: "required but not bound and has no default".to_string(),
                    });
                }
            }
        }
    }
    Ok(bound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use serde_json::json;
    use stageflow_types::run::failure_kind;
    use stageflow_types::workflow::{
        DeclaredType, ErrorPolicy, ErrorPolicyOverride, GateConfig, GateTimeoutAction, HookAction,
        HookConfig, InputDeclaration, OutputDeclaration, RetryPolicy, RoleAssignment, StageType,
        WorkflowConfig, WorkflowMeta,
    };

    use crate::ports::{
        ApprovalDecision, ApprovalError, ApprovalRequest, CapabilityCall, CapabilityFailure,
        CapabilityOutcome, HookDeliveryError,
    };

    // -- Port doubles ------------------------------------------------------

    /// Registry double routing on capability name, recording call order.
    struct RouteRegistry {
        /// capability -> (failures before success, outputs)
        routes: HashMap<String, (AtomicU32, HashMap<String, Value>)>,
        calls: Mutex<Vec<CapabilityCall>>,
    }

    impl RouteRegistry {
        fn new(routes: Vec<(&str, HashMap<String, Value>)>) -> Self {
            Self {
                routes: routes
                    .into_iter()
                    .map(|(cap, outputs)| (cap.to_string(), (AtomicU32::new(0), outputs)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn flaky(capability: &str, failures: u32, outputs: HashMap<String, Value>) -> Self {
            Self {
                routes: HashMap::from([(
                    capability.to_string(),
                    (AtomicU32::new(failures), outputs),
                )]),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn invoked_capabilities(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.capability.clone())
                .collect()
        }

        fn calls_for(&self, stage_id: &str) -> Vec<CapabilityCall> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.stage_id == stage_id)
                .cloned()
                .collect()
        }
    }

    impl CapabilityRegistry for RouteRegistry {
        fn invoke<'a>(
            &'a self,
            call: &'a CapabilityCall,
        ) -> BoxFuture<'a, Result<CapabilityOutcome, CapabilityFailure>> {
            async move {
                self.calls.lock().unwrap().push(call.clone());
                let Some((failures, outputs)) = self.routes.get(&call.capability) else {
                    return Err(CapabilityFailure::new(
                        failure_kind::RUNNER_EXECUTION,
                        format!("unknown capability '{}'", call.capability),
                    ));
                };
                let remaining = failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(CapabilityFailure::new(
                        failure_kind::RUNNER_EXECUTION,
                        "scripted failure",
                    ));
                }
                Ok(CapabilityOutcome {
                    outputs: outputs.clone(),
                })
            }
            .boxed()
        }
    }

    /// Registry double that waits until cancelled.
    struct HangingRegistry;

    impl CapabilityRegistry for HangingRegistry {
        fn invoke<'a>(
            &'a self,
            call: &'a CapabilityCall,
        ) -> BoxFuture<'a, Result<CapabilityOutcome, CapabilityFailure>> {
            async move {
                call.cancel.cancelled().await;
                Err(CapabilityFailure::new(failure_kind::CANCELLED, "cancelled"))
            }
            .boxed()
        }
    }

    struct NoContext;

    impl ContextProvider for NoContext {
        fn resolve<'a>(
            &'a self,
            _modules: &'a [String],
            _memory: Option<&'a stageflow_types::workflow::MemoryQueryPolicy>,
        ) -> BoxFuture<'a, Result<Vec<ContextBlock>, ContextError>> {
            async move { Ok(Vec::new()) }.boxed()
        }
    }

    /// Approval double: optional delay, then a fixed decision. `None` hangs.
    struct ScriptedApprovals {
        decision: Option<ApprovalDecision>,
        delay: Duration,
    }

    impl ScriptedApprovals {
        fn instant(decision: ApprovalDecision) -> Self {
            Self {
                decision: Some(decision),
                delay: Duration::ZERO,
            }
        }

        fn delayed(decision: ApprovalDecision, delay: Duration) -> Self {
            Self {
                decision: Some(decision),
                delay,
            }
        }

        fn pending() -> Self {
            Self {
                decision: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl ApprovalSink for ScriptedApprovals {
        fn request<'a>(
            &'a self,
            _request: &'a ApprovalRequest,
        ) -> BoxFuture<'a, Result<ApprovalDecision, ApprovalError>> {
            match &self.decision {
                Some(decision) => {
                    let decision = decision.clone();
                    let delay = self.delay;
                    async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok(decision)
                    }
                    .boxed()
                }
                None => futures_util::future::pending().boxed(),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        delivered: Mutex<Vec<(HookEvent, HookAction)>>,
    }

    impl crate::ports::HookSink for RecordingHooks {
        fn deliver<'a>(
            &'a self,
            event: HookEvent,
            action: &'a HookAction,
        ) -> BoxFuture<'a, Result<(), HookDeliveryError>> {
            async move {
                self.delivered.lock().unwrap().push((event, action.clone()));
                Ok(())
            }
            .boxed()
        }
    }

    // -- Definition builders ----------------------------------------------

    fn agent_stage(id: &str, capability: &str, depends_on: Vec<&str>) -> StageDefinition {
        StageDefinition {
            id: id.to_string(),
            name: id.to_string(),
            stage_type: StageType::Agent,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            condition: None,
            role: Some(RoleAssignment {
                capability: capability.to_string(),
                model: None,
                instructions: None,
                tools: vec![],
            }),
            gate: None,
            fan_out: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            timeout_secs: None,
            error_policy: None,
            context: None,
            handoff: None,
            ui: None,
        }
    }

    fn gate_stage(id: &str, depends_on: Vec<&str>) -> StageDefinition {
        let mut stage = agent_stage(id, "", depends_on);
        stage.stage_type = StageType::Gate;
        stage.role = None;
        stage.gate = Some(GateConfig {
            approvers: vec!["alice".to_string()],
            timeout_secs: 60,
            on_timeout: GateTimeoutAction::Reject,
            message: None,
        });
        stage
    }

    fn workflow(stages: Vec<StageDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow: WorkflowMeta {
                id: "test-workflow".to_string(),
                name: "Test Workflow".to_string(),
                version: "1.0.0".to_string(),
                description: None,
                tags: vec![],
                ui: None,
            },
            config: WorkflowConfig::default(),
            context: None,
            stages,
            error_policy: ErrorPolicy {
                default_retry: None,
                on_stage_failure: OnFailure::Continue,
            },
            hooks: None,
        }
    }

    fn coordinator(
        registry: Arc<dyn CapabilityRegistry>,
        approvals: Arc<dyn ApprovalSink>,
    ) -> RunCoordinator {
        RunCoordinator::new(
            registry,
            approvals,
            Arc::new(NoContext),
            Arc::new(RecordingHooks::default()),
        )
    }

    // -----------------------------------------------------------------------
    // Happy path and data flow
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_run_passes_outputs_downstream() {
        let registry = Arc::new(RouteRegistry::new(vec![
            (
                "builder",
                HashMap::from([("artifact".to_string(), json!("img:1"))]),
            ),
            ("deployer", HashMap::new()),
        ]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut build = agent_stage("build", "builder", vec![]);
        build.outputs.insert(
            "artifact".to_string(),
            OutputDeclaration {
                output_type: DeclaredType::String,
                required: true,
                description: None,
                default: None,
            },
        );
        let mut deploy = agent_stage("deploy", "deployer", vec!["build"]);
        deploy.inputs.insert(
            "artifact".to_string(),
            InputDeclaration {
                input_type: DeclaredType::String,
                source: "${{ stages.build.outputs.artifact }}".to_string(),
                required: true,
                description: None,
            },
        );

        let report = coord
            .start(&workflow(vec![build, deploy]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.state.status, RunStatus::Succeeded);
        assert!(report.state.all_stages_terminal());
        assert_eq!(report.outputs["build"]["artifact"], json!("img:1"));

        // The dependent received the upstream output as its input.
        let deploy_calls = registry.calls_for("deploy");
        assert_eq!(deploy_calls.len(), 1);
        assert_eq!(deploy_calls[0].inputs["artifact"], json!("img:1"));
    }

    #[tokio::test]
    async fn test_dependency_ordering_is_respected() {
        let registry = Arc::new(RouteRegistry::new(vec![
            ("first", HashMap::new()),
            ("second", HashMap::new()),
        ]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let stages = vec![
            agent_stage("a", "first", vec![]),
            agent_stage("b", "second", vec!["a"]),
        ];
        let report = coord.start(&workflow(stages), HashMap::new()).await.unwrap();

        assert_eq!(report.state.status, RunStatus::Succeeded);
        assert_eq!(registry.invoked_capabilities(), vec!["first", "second"]);
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_parameter_binding_rejected() {
        let coord = coordinator(
            Arc::new(RouteRegistry::new(vec![("x", HashMap::new())])),
            Arc::new(ScriptedApprovals::pending()),
        );
        let def = workflow(vec![agent_stage("a", "x", vec![])]);

        let err = coord
            .start(&def, HashMap::from([("ghost".to_string(), json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Parameter { .. }));
    }

    #[tokio::test]
    async fn test_required_parameter_missing_rejected() {
        let coord = coordinator(
            Arc::new(RouteRegistry::new(vec![("x", HashMap::new())])),
            Arc::new(ScriptedApprovals::pending()),
        );
        let mut def = workflow(vec![agent_stage("a", "x", vec![])]);
        def.config.parameters.insert(
            "env".to_string(),
            ParameterSpec {
                param_type: DeclaredType::String,
                required: true,
                default: None,
                description: None,
            },
        );

        let err = coord.start(&def, HashMap::new()).await.unwrap_err();
        match err {
            CoordinatorError::Parameter { name, .. } => assert_eq!(name, "env"),
            other => panic!("expected Parameter error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_parameter_default_applied_and_visible_to_expressions() {
        let registry = Arc::new(RouteRegistry::new(vec![("x", HashMap::new())]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut def = workflow(vec![agent_stage("a", "x", vec![])]);
        def.config.parameters.insert(
            "env".to_string(),
            ParameterSpec {
                param_type: DeclaredType::String,
                required: false,
                default: Some(json!("staging")),
                description: None,
            },
        );
        def.stages[0].inputs.insert(
            "target".to_string(),
            InputDeclaration {
                input_type: DeclaredType::String,
                source: "${{ parameters.env }}".to_string(),
                required: true,
                description: None,
            },
        );

        let report = coord.start(&def, HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Succeeded);
        assert_eq!(
            registry.calls_for("a")[0].inputs["target"],
            json!("staging")
        );
    }

    // -----------------------------------------------------------------------
    // Skip contract
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_skipped_stage_fails_dependent_without_default() {
        let registry = Arc::new(RouteRegistry::new(vec![
            ("skipper", HashMap::new()),
            ("consumer", HashMap::new()),
        ]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut skipped = agent_stage("optional", "skipper", vec![]);
        skipped.condition = Some("${{ parameters.enabled == true }}".to_string());
        skipped.outputs.insert(
            "result".to_string(),
            OutputDeclaration {
                output_type: DeclaredType::String,
                required: true,
                description: None,
                default: None, // no default -> dependents must fail
            },
        );
        let mut dependent = agent_stage("consumer", "consumer", vec!["optional"]);
        dependent.inputs.insert(
            "data".to_string(),
            InputDeclaration {
                input_type: DeclaredType::Any,
                source: "${{ stages.optional.outputs.result }}".to_string(),
                required: true,
                description: None,
            },
        );

        let mut def = workflow(vec![skipped, dependent]);
        def.config.parameters.insert(
            "enabled".to_string(),
            ParameterSpec {
                param_type: DeclaredType::Boolean,
                required: false,
                default: Some(json!(false)),
                description: None,
            },
        );

        let report = coord.start(&def, HashMap::new()).await.unwrap();

        assert_eq!(
            report.state.stage_status("optional"),
            Some(StageStatus::Skipped)
        );
        let consumer = report.state.stage("consumer").unwrap();
        assert_eq!(consumer.status, StageStatus::Failed);
        assert_eq!(
            consumer.failure.as_ref().unwrap().kind,
            failure_kind::MISSING_INPUT
        );
        // The consumer never reached dispatch.
        assert!(registry.calls_for("consumer").is_empty());
        assert_eq!(report.state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_skipped_stage_feeds_dependent_through_default() {
        let registry = Arc::new(RouteRegistry::new(vec![
            ("skipper", HashMap::new()),
            ("consumer", HashMap::new()),
        ]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut skipped = agent_stage("optional", "skipper", vec![]);
        skipped.condition = Some("${{ 1 == 2 }}".to_string());
        skipped.outputs.insert(
            "result".to_string(),
            OutputDeclaration {
                output_type: DeclaredType::String,
                required: true,
                description: None,
                default: Some(json!("fallback")),
            },
        );
        let mut dependent = agent_stage("consumer", "consumer", vec!["optional"]);
        dependent.inputs.insert(
            "data".to_string(),
            InputDeclaration {
                input_type: DeclaredType::String,
                source: "${{ stages.optional.outputs.result }}".to_string(),
                required: true,
                description: None,
            },
        );

        let report = coord
            .start(&workflow(vec![skipped, dependent]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.state.status, RunStatus::Succeeded);
        assert_eq!(
            registry.calls_for("consumer")[0].inputs["data"],
            json!("fallback")
        );
    }

    // -----------------------------------------------------------------------
    // Failure directives
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_halt_cancels_pending_stages_and_records_trigger() {
        let registry = Arc::new(RouteRegistry::new(vec![("good", HashMap::new())]));
        let coord = coordinator(registry, Arc::new(ScriptedApprovals::pending()));

        let mut failing = agent_stage("doomed", "missing-capability", vec![]);
        failing.error_policy = Some(ErrorPolicyOverride {
            retry: None,
            on_failure: Some(OnFailure::Halt),
        });
        let dependent = agent_stage("after", "good", vec!["doomed"]);
        let tail = agent_stage("tail", "good", vec!["after"]);

        let report = coord
            .start(&workflow(vec![failing, dependent, tail]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.state.status, RunStatus::Halted);
        assert_eq!(report.state.halted_by.as_deref(), Some("doomed"));
        assert_eq!(
            report.state.stage_status("doomed"),
            Some(StageStatus::Failed)
        );
        assert_eq!(
            report.state.stage_status("after"),
            Some(StageStatus::Cancelled)
        );
        assert_eq!(
            report.state.stage_status("tail"),
            Some(StageStatus::Cancelled)
        );
        assert!(report.state.error.is_some());
    }

    #[tokio::test]
    async fn test_skip_dependents_skips_transitively_and_continues_elsewhere() {
        let registry = Arc::new(RouteRegistry::new(vec![("good", HashMap::new())]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut failing = agent_stage("doomed", "missing-capability", vec![]);
        failing.error_policy = Some(ErrorPolicyOverride {
            retry: None,
            on_failure: Some(OnFailure::SkipDependents),
        });
        let child = agent_stage("child", "good", vec!["doomed"]);
        let grandchild = agent_stage("grandchild", "good", vec!["child"]);
        let independent = agent_stage("independent", "good", vec![]);

        let report = coord
            .start(
                &workflow(vec![failing, child, grandchild, independent]),
                HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            report.state.stage_status("doomed"),
            Some(StageStatus::Failed)
        );
        assert_eq!(
            report.state.stage_status("child"),
            Some(StageStatus::Skipped)
        );
        assert_eq!(
            report.state.stage_status("grandchild"),
            Some(StageStatus::Skipped)
        );
        assert_eq!(
            report.state.stage_status("independent"),
            Some(StageStatus::Succeeded)
        );
        assert_eq!(report.state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_continue_lets_independent_stages_proceed() {
        let registry = Arc::new(RouteRegistry::new(vec![("good", HashMap::new())]));
        let coord = coordinator(registry, Arc::new(ScriptedApprovals::pending()));

        let failing = agent_stage("doomed", "missing-capability", vec![]);
        let independent = agent_stage("independent", "good", vec![]);

        // Workflow default is continue (set in workflow()).
        let report = coord
            .start(&workflow(vec![failing, independent]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            report.state.stage_status("doomed"),
            Some(StageStatus::Failed)
        );
        assert_eq!(
            report.state.stage_status("independent"),
            Some(StageStatus::Succeeded)
        );
        assert_eq!(report.state.status, RunStatus::Failed);
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_flaky_stage_retries_to_success() {
        let registry = Arc::new(RouteRegistry::flaky(
            "flaky",
            2,
            HashMap::from([("ok".to_string(), json!(true))]),
        ));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut def = workflow(vec![agent_stage("wobbly", "flaky", vec![])]);
        def.error_policy.default_retry = Some(RetryPolicy {
            max_attempts: 3,
            initial_interval_secs: 0,
            ..RetryPolicy::default()
        });

        let report = coord.start(&def, HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Succeeded);
        let record = report.state.stage("wobbly").unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(registry.calls_for("wobbly").len(), 3);
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_gate_approval_unblocks_dependents() {
        let registry = Arc::new(RouteRegistry::new(vec![("good", HashMap::new())]));
        let approvals = Arc::new(ScriptedApprovals::instant(ApprovalDecision::Approved {
            approver: Some("alice".to_string()),
        }));
        let coord = coordinator(registry, approvals);

        let gate = gate_stage("approve", vec![]);
        let mut after = agent_stage("after", "good", vec!["approve"]);
        after.condition = Some("${{ stages.approve.outputs.approved == true }}".to_string());

        let report = coord
            .start(&workflow(vec![gate, after]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.state.status, RunStatus::Succeeded);
        assert_eq!(
            report.state.stage_status("approve"),
            Some(StageStatus::Succeeded)
        );
        assert_eq!(report.outputs["approve"]["approved"], json!(true));
        assert_eq!(
            report.state.stage_status("after"),
            Some(StageStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_waiting_gate_suspends_only_its_downstream_subgraph() {
        let registry = Arc::new(RouteRegistry::new(vec![
            ("side", HashMap::new()),
            ("behind-gate", HashMap::new()),
            ("behind-side", HashMap::new()),
        ]));
        let approvals = Arc::new(ScriptedApprovals::delayed(
            ApprovalDecision::Approved { approver: None },
            Duration::from_millis(400),
        ));
        let coord = coordinator(registry.clone(), approvals);

        // Batch 0: gate + side. Batch 1: behind-gate (deps gate), behind-side
        // (deps side). The sibling branch must not wait for the approval.
        let stages = vec![
            gate_stage("gate", vec![]),
            agent_stage("side", "side", vec![]),
            agent_stage("behind-gate", "behind-gate", vec!["gate"]),
            agent_stage("behind-side", "behind-side", vec!["side"]),
        ];

        let report = coord.start(&workflow(stages), HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Succeeded);

        // The sibling branch finished before the gate's branch started:
        // behind-side was invoked before behind-gate.
        let order = registry.invoked_capabilities();
        let side_pos = order.iter().position(|c| c == "behind-side").unwrap();
        let gate_pos = order.iter().position(|c| c == "behind-gate").unwrap();
        assert!(
            side_pos < gate_pos,
            "sibling branch should not wait for the gate: {order:?}"
        );
    }

    #[tokio::test]
    async fn test_gate_timeout_reject_with_halt_policy_halts_run() {
        let registry = Arc::new(RouteRegistry::new(vec![("good", HashMap::new())]));
        let coord = coordinator(registry, Arc::new(ScriptedApprovals::pending()));

        let mut gate = gate_stage("approve", vec![]);
        if let Some(config) = gate.gate.as_mut() {
            config.timeout_secs = 1;
            config.on_timeout = GateTimeoutAction::Reject;
        }
        gate.error_policy = Some(ErrorPolicyOverride {
            retry: None,
            on_failure: Some(OnFailure::Halt),
        });
        let after = agent_stage("after", "good", vec!["approve"]);

        let report = coord
            .start(&workflow(vec![gate, after]), HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            report.state.stage_status("approve"),
            Some(StageStatus::Failed)
        );
        assert_eq!(
            report
                .state
                .stage("approve")
                .unwrap()
                .failure
                .as_ref()
                .unwrap()
                .kind,
            failure_kind::GATE_TIMEOUT
        );
        assert_eq!(report.state.status, RunStatus::Halted);
        assert_eq!(report.state.halted_by.as_deref(), Some("approve"));
    }

    // -----------------------------------------------------------------------
    // Cancellation and run timeout
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_marks_stages_cancelled() {
        let registry = Arc::new(HangingRegistry);
        let coord = Arc::new(coordinator(registry, Arc::new(ScriptedApprovals::pending())));

        let def = workflow(vec![agent_stage("slow", "x", vec![])]);
        let mut events = coord.events().subscribe();

        let runner = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.start(&def, HashMap::new()).await })
        };

        // Wait for the run to announce itself, then cancel it.
        let run_id = loop {
            match events.recv().await.unwrap() {
                RunEvent::RunStarted { run_id, .. } => break run_id,
                _ => continue,
            }
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord.cancel(run_id));

        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.state.status, RunStatus::Cancelled);
        assert_eq!(
            report.state.stage_status("slow"),
            Some(StageStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_run_timeout_halts_run() {
        let registry = Arc::new(HangingRegistry);
        let coord = coordinator(registry, Arc::new(ScriptedApprovals::pending()));

        let mut def = workflow(vec![agent_stage("slow", "x", vec![])]);
        def.config.timeout_secs = Some(1);

        let report = coord.start(&def, HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Halted);
        assert!(report.state.error.as_ref().unwrap().contains("timeout"));
        assert_eq!(
            report.state.stage_status("slow"),
            Some(StageStatus::Cancelled)
        );
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    fn hook(name: &str, text: &str) -> HookAction {
        HookAction {
            name: name.to_string(),
            action: "chat.post".to_string(),
            with: HashMap::from([("text".to_string(), json!(text))]),
        }
    }

    #[tokio::test]
    async fn test_hooks_fire_on_start_and_complete() {
        let hooks = Arc::new(RecordingHooks::default());
        let coord = RunCoordinator::new(
            Arc::new(RouteRegistry::new(vec![("x", HashMap::new())])),
            Arc::new(ScriptedApprovals::pending()),
            Arc::new(NoContext),
            hooks.clone(),
        );

        let mut def = workflow(vec![agent_stage("a", "x", vec![])]);
        def.hooks = Some(HookConfig {
            on_start: vec![hook("announce", "starting ${{ workflow.name }}")],
            on_complete: vec![hook("celebrate", "done: ${{ stages.a.status }}")],
            on_failure: vec![hook("page", "failed")],
        });

        let report = coord.start(&def, HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Succeeded);

        let delivered = hooks.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, HookEvent::Start);
        assert_eq!(
            delivered[0].1.with["text"],
            json!("starting Test Workflow")
        );
        assert_eq!(delivered[1].0, HookEvent::Complete);
        assert_eq!(delivered[1].1.with["text"], json!("done: succeeded"));
    }

    #[tokio::test]
    async fn test_failure_hook_fires_on_halt() {
        let hooks = Arc::new(RecordingHooks::default());
        let coord = RunCoordinator::new(
            Arc::new(RouteRegistry::new(vec![("x", HashMap::new())])),
            Arc::new(ScriptedApprovals::pending()),
            Arc::new(NoContext),
            hooks.clone(),
        );

        let mut failing = agent_stage("doomed", "missing", vec![]);
        failing.error_policy = Some(ErrorPolicyOverride {
            retry: None,
            on_failure: Some(OnFailure::Halt),
        });
        let mut def = workflow(vec![failing]);
        def.hooks = Some(HookConfig {
            on_start: vec![],
            on_complete: vec![hook("celebrate", "done")],
            on_failure: vec![hook("page", "run failed")],
        });

        let report = coord.start(&def, HashMap::new()).await.unwrap();
        assert_eq!(report.state.status, RunStatus::Halted);

        let delivered = hooks.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, HookEvent::Failure);
        assert_eq!(delivered[0].1.name, "page");
    }

    // -----------------------------------------------------------------------
    // Dry run
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_dry_run_previews_without_dispatch() {
        let registry = Arc::new(RouteRegistry::new(vec![
            ("builder", HashMap::new()),
            ("deployer", HashMap::new()),
        ]));
        let coord = coordinator(registry.clone(), Arc::new(ScriptedApprovals::pending()));

        let mut build = agent_stage("build", "builder", vec![]);
        build.inputs.insert(
            "target".to_string(),
            InputDeclaration {
                input_type: DeclaredType::String,
                source: "${{ parameters.env }}".to_string(),
                required: true,
                description: None,
            },
        );
        let mut deploy = agent_stage("deploy", "deployer", vec!["build"]);
        deploy.condition = Some("${{ parameters.env == 'prod' }}".to_string());
        deploy.inputs.insert(
            "artifact".to_string(),
            InputDeclaration {
                input_type: DeclaredType::Any,
                source: "${{ stages.build.outputs.artifact }}".to_string(),
                required: true,
                description: None,
            },
        );

        let mut def = workflow(vec![build, deploy]);
        def.config.parameters.insert(
            "env".to_string(),
            ParameterSpec {
                param_type: DeclaredType::String,
                required: true,
                default: None,
                description: None,
            },
        );

        let report = coord
            .dry_run(&def, HashMap::from([("env".to_string(), json!("prod"))]))
            .await
            .unwrap();

        assert_eq!(report.batches, vec![vec!["build"], vec!["deploy"]]);
        assert!(registry.calls.lock().unwrap().is_empty(), "no dispatch");

        let build_preview = &report.stages[0];
        assert_eq!(build_preview.inputs["target"], Ok(json!("prod")));

        let deploy_preview = &report.stages[1];
        assert_eq!(deploy_preview.condition, Some(Ok(json!(true))));
        // build has not run and declares no default: the preview records
        // the unresolved reference rather than failing the dry run.
        assert!(deploy_preview.inputs["artifact"].is_err());
    }
}
