//! Stage executor: drives one stage through its state machine.
//!
//! Per attempt: evaluate the condition, resolve declared inputs, dispatch to
//! the capability registry under a timeout, validate the output contract.
//! Failures route through the retry engine inside the stage task, so backoff
//! sleeps never block sibling stages. The executor only *reports* results --
//! every `RunState` mutation happens in the coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use stageflow_types::run::{failure_kind, StageFailure, StageStatus};
use stageflow_types::workflow::{
    GateTimeoutAction, OnFailure, RoleAssignment, StageDefinition, StageType,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::expr::{self, template};
use crate::ports::{
    ApprovalDecision, ApprovalRequest, ApprovalSink, CapabilityCall, CapabilityRegistry,
    ContextBlock, ContextProvider,
};

use super::retry::{self, EffectivePolicy, RetryDecision};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-attempt timeout for agent stages (5 minutes).
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 300;

/// Default per-attempt timeout for fan-out stages (10 minutes).
pub const DEFAULT_FAN_OUT_TIMEOUT_SECS: u64 = 600;

/// Default per-stage fan-out parallelism when `max_parallel` is unset.
pub const DEFAULT_FAN_OUT_PARALLELISM: usize = 4;

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

/// Messages a stage task reports to the coordinator.
#[derive(Debug)]
pub enum StageEvent {
    /// The stage passed its condition and began executing.
    Started { stage_id: String },
    /// A gate stage is waiting for an approval decision.
    Suspended { stage_id: String },
    /// The stage reached a terminal result.
    Finished(StageOutcome),
}

/// Terminal result of one stage task.
#[derive(Debug)]
pub struct StageOutcome {
    pub stage_id: String,
    /// `Succeeded`, `Skipped`, `Failed`, or `Cancelled`.
    pub status: StageStatus,
    pub outputs: HashMap<String, Value>,
    pub attempts: u32,
    pub failure: Option<StageFailure>,
    /// The `on_failure` directive the coordinator must apply (failed stages).
    pub directive: Option<OnFailure>,
    /// Halt the run regardless of `on_failure` (gate `on_timeout: halt`).
    pub force_halt: bool,
}

impl StageOutcome {
    fn succeeded(stage_id: &str, outputs: HashMap<String, Value>, attempts: u32) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Succeeded,
            outputs,
            attempts,
            failure: None,
            directive: None,
            force_halt: false,
        }
    }

    fn skipped(stage_id: &str, outputs: HashMap<String, Value>) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Skipped,
            outputs,
            attempts: 0,
            failure: None,
            directive: None,
            force_halt: false,
        }
    }

    fn failed(
        stage_id: &str,
        outputs: HashMap<String, Value>,
        failure: StageFailure,
        attempts: u32,
        directive: OnFailure,
    ) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Failed,
            outputs,
            attempts,
            failure: Some(failure),
            directive: Some(directive),
            force_halt: false,
        }
    }

    fn cancelled(stage_id: &str, attempts: u32) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Cancelled,
            outputs: HashMap::new(),
            attempts,
            failure: Some(StageFailure::new(failure_kind::CANCELLED, "run cancelled")),
            directive: None,
            force_halt: false,
        }
    }
}

/// Everything one stage task needs, cloned out of the coordinator.
pub struct StageRun {
    pub run_id: Uuid,
    pub stage: StageDefinition,
    pub policy: EffectivePolicy,
    /// Immutable expression-context snapshot taken at dispatch time.
    pub snapshot: Value,
    /// Workflow-level context blocks (used unless the stage overrides).
    pub base_blocks: Vec<ContextBlock>,
    /// Bounds concurrently executing capability dispatches.
    pub limiter: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

/// Executes stages against the engine's ports.
pub struct StageExecutor {
    registry: Arc<dyn CapabilityRegistry>,
    approvals: Arc<dyn ApprovalSink>,
    contexts: Arc<dyn ContextProvider>,
}

impl StageExecutor {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        approvals: Arc<dyn ApprovalSink>,
        contexts: Arc<dyn ContextProvider>,
    ) -> Self {
        Self {
            registry,
            approvals,
            contexts,
        }
    }

    /// Drive one stage to a terminal outcome, reporting transitions on `events`.
    pub async fn execute(&self, run: StageRun, events: mpsc::Sender<StageEvent>) {
        let outcome = self.run_stage(&run, &events).await;
        let _ = events.send(StageEvent::Finished(outcome)).await;
    }

    async fn run_stage(&self, run: &StageRun, events: &mpsc::Sender<StageEvent>) -> StageOutcome {
        let stage = &run.stage;

        // (a) condition -- absence means true; false skips without dispatch.
        if let Some(condition) = &stage.condition {
            match template::evaluate_source(condition, &run.snapshot) {
                Ok(value) => {
                    if !expr::truthy(&value) {
                        tracing::debug!(
                            stage_id = stage.id.as_str(),
                            "condition evaluated false, skipping stage"
                        );
                        return StageOutcome::skipped(&stage.id, default_outputs(stage));
                    }
                }
                Err(e) => {
                    let failure =
                        StageFailure::new(failure_kind::CONDITION_EVALUATION, e.to_string());
                    return StageOutcome::failed(
                        &stage.id,
                        default_outputs(stage),
                        failure,
                        0,
                        run.policy.on_failure,
                    );
                }
            }
        }

        match stage.stage_type {
            StageType::Gate => self.run_gate(run, events).await,
            StageType::Agent | StageType::FanOut => {
                let _ = events
                    .send(StageEvent::Started {
                        stage_id: stage.id.clone(),
                    })
                    .await;
                self.run_capability(run).await
            }
        }
    }

    // -- Gate: suspend on the approval sink, resolve timeout per on_timeout --

    async fn run_gate(&self, run: &StageRun, events: &mpsc::Sender<StageEvent>) -> StageOutcome {
        let stage = &run.stage;
        let Some(gate) = &stage.gate else {
            // The loader guarantees this; reaching it means the definition
            // bypassed validation.
            let failure = StageFailure::new(
                failure_kind::RUNNER_EXECUTION,
                "gate stage without gate configuration",
            );
            return StageOutcome::failed(
                &stage.id,
                default_outputs(stage),
                failure,
                0,
                run.policy.on_failure,
            );
        };

        let _ = events
            .send(StageEvent::Suspended {
                stage_id: stage.id.clone(),
            })
            .await;

        let message = gate.message.as_ref().map(|text| {
            template::interpolate(text, &run.snapshot).unwrap_or_else(|e| {
                tracing::warn!(
                    stage_id = stage.id.as_str(),
                    error = %e,
                    "gate message interpolation failed, using raw text"
                );
                text.clone()
            })
        });
        let request = ApprovalRequest {
            run_id: run.run_id,
            stage_id: stage.id.clone(),
            approvers: gate.approvers.clone(),
            message,
        };
        let window = Duration::from_secs(gate.timeout_secs);

        let decision = tokio::select! {
            _ = run.cancel.cancelled() => return StageOutcome::cancelled(&stage.id, 1),
            decision = tokio::time::timeout(window, self.approvals.request(&request)) => decision,
        };

        match decision {
            Ok(Ok(ApprovalDecision::Approved { approver })) => {
                let mut outputs = default_outputs(stage);
                outputs.insert("approved".to_string(), json!(true));
                if let Some(approver) = approver {
                    outputs.insert("approver".to_string(), json!(approver));
                }
                StageOutcome::succeeded(&stage.id, outputs, 1)
            }
            Ok(Ok(ApprovalDecision::Rejected { approver, reason })) => {
                let detail = match (approver, reason) {
                    (Some(who), Some(why)) => format!("rejected by {who}: {why}"),
                    (Some(who), None) => format!("rejected by {who}"),
                    (None, Some(why)) => format!("rejected: {why}"),
                    (None, None) => "rejected".to_string(),
                };
                StageOutcome::failed(
                    &stage.id,
                    default_outputs(stage),
                    StageFailure::new(failure_kind::GATE_REJECTED, detail),
                    1,
                    run.policy.on_failure,
                )
            }
            Ok(Err(e)) => StageOutcome::failed(
                &stage.id,
                default_outputs(stage),
                StageFailure::new(failure_kind::RUNNER_EXECUTION, e.to_string()),
                1,
                run.policy.on_failure,
            ),
            Err(_elapsed) => match gate.on_timeout {
                GateTimeoutAction::AutoApprove => {
                    tracing::info!(
                        stage_id = stage.id.as_str(),
                        "approval window elapsed, auto-approving"
                    );
                    let mut outputs = default_outputs(stage);
                    outputs.insert("approved".to_string(), json!(true));
                    outputs.insert("auto_approved".to_string(), json!(true));
                    StageOutcome::succeeded(&stage.id, outputs, 1)
                }
                GateTimeoutAction::Reject => StageOutcome::failed(
                    &stage.id,
                    default_outputs(stage),
                    StageFailure::new(
                        failure_kind::GATE_TIMEOUT,
                        format!("no decision within {}s", gate.timeout_secs),
                    ),
                    1,
                    run.policy.on_failure,
                ),
                GateTimeoutAction::Halt => {
                    let mut outcome = StageOutcome::failed(
                        &stage.id,
                        default_outputs(stage),
                        StageFailure::new(
                            failure_kind::GATE_TIMEOUT,
                            format!("no decision within {}s", gate.timeout_secs),
                        ),
                        1,
                        OnFailure::Halt,
                    );
                    outcome.force_halt = true;
                    outcome
                }
            },
        }
    }

    // -- Agent / fan-out: inputs, dispatch with retry, output contract --

    async fn run_capability(&self, run: &StageRun) -> StageOutcome {
        let stage = &run.stage;

        // (b) input resolution -- a required input that does not resolve
        // fails the stage without dispatch.
        let inputs = match resolve_inputs(stage, &run.snapshot) {
            Ok(inputs) => inputs,
            Err(failure) => {
                return StageOutcome::failed(
                    &stage.id,
                    default_outputs(stage),
                    failure,
                    0,
                    run.policy.on_failure,
                )
            }
        };

        // Fan-out item collection, resolved once per stage: evaluation is
        // deterministic against the snapshot, so retries reuse it.
        let items = match &stage.fan_out {
            Some(fan_out) if stage.stage_type == StageType::FanOut => {
                match template::evaluate_source(&fan_out.items, &run.snapshot) {
                    Ok(Value::Array(items)) => Some(items),
                    Ok(_) => {
                        let failure = StageFailure::new(
                            failure_kind::MISSING_INPUT,
                            "fan_out items expression did not produce an array",
                        );
                        return StageOutcome::failed(
                            &stage.id,
                            default_outputs(stage),
                            failure,
                            0,
                            run.policy.on_failure,
                        );
                    }
                    Err(e) => {
                        let failure =
                            StageFailure::new(failure_kind::MISSING_INPUT, e.to_string());
                        return StageOutcome::failed(
                            &stage.id,
                            default_outputs(stage),
                            failure,
                            0,
                            run.policy.on_failure,
                        );
                    }
                }
            }
            _ => None,
        };

        let timeout = Duration::from_secs(stage.timeout_secs.unwrap_or(match stage.stage_type {
            StageType::FanOut => DEFAULT_FAN_OUT_TIMEOUT_SECS,
            _ => DEFAULT_AGENT_TIMEOUT_SECS,
        }));

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if run.cancel.is_cancelled() {
                return StageOutcome::cancelled(&stage.id, attempts);
            }

            let produced = self
                .dispatch_attempt(run, &inputs, items.as_deref(), attempts, timeout)
                .await;

            match produced {
                Ok(outputs) => {
                    // Fan-out outputs were validated per element and aggregated.
                    if items.is_some() {
                        return StageOutcome::succeeded(&stage.id, outputs, attempts);
                    }
                    // (d) output contract
                    match validate_outputs(stage, outputs) {
                        Ok(outputs) => {
                            return StageOutcome::succeeded(&stage.id, outputs, attempts)
                        }
                        Err(failure) => {
                            return StageOutcome::failed(
                                &stage.id,
                                default_outputs(stage),
                                failure,
                                attempts,
                                run.policy.on_failure,
                            )
                        }
                    }
                }
                Err(failure) => {
                    if failure.kind == failure_kind::CANCELLED {
                        return StageOutcome::cancelled(&stage.id, attempts);
                    }
                    match retry::decide(&run.policy, &failure, attempts) {
                        RetryDecision::Retry { delay } => {
                            tracing::info!(
                                stage_id = stage.id.as_str(),
                                attempt = attempts,
                                delay_secs = delay.as_secs(),
                                error = %failure,
                                "stage attempt failed, retrying after backoff"
                            );
                            tokio::select! {
                                _ = run.cancel.cancelled() => {
                                    return StageOutcome::cancelled(&stage.id, attempts)
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::GiveUp { directive } => {
                            return StageOutcome::failed(
                                &stage.id,
                                default_outputs(stage),
                                failure,
                                attempts,
                                directive,
                            );
                        }
                    }
                }
            }
        }
    }

    /// One dispatch attempt: context resolution plus the capability call(s),
    /// bounded by the per-attempt timeout and the concurrency limiter.
    async fn dispatch_attempt(
        &self,
        run: &StageRun,
        inputs: &HashMap<String, Value>,
        items: Option<&[Value]>,
        attempt: u32,
        timeout: Duration,
    ) -> Result<HashMap<String, Value>, StageFailure> {
        let stage = &run.stage;

        let _permit = match run.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(StageFailure::new(
                    failure_kind::RUNNER_EXECUTION,
                    "concurrency limiter closed",
                ))
            }
        };

        // Stage-level context override, else the workflow-level blocks.
        let blocks = match &stage.context {
            Some(policy) => self
                .contexts
                .resolve(&policy.modules, policy.memory.as_ref())
                .await
                .map_err(|e| StageFailure::new(failure_kind::RUNNER_EXECUTION, e.to_string()))?,
            None => run.base_blocks.clone(),
        };

        let Some(role) = &stage.role else {
            return Err(StageFailure::new(
                failure_kind::RUNNER_EXECUTION,
                "stage has no role assignment",
            ));
        };

        let work = async {
            match items {
                None => {
                    let call = self.build_call(run, role, inputs.clone(), blocks.clone(), attempt);
                    self.registry
                        .invoke(&call)
                        .await
                        .map(|outcome| outcome.outputs)
                        .map_err(|e| StageFailure::new(e.kind, e.message))
                }
                Some(items) => {
                    self.dispatch_fan_out(run, role, inputs, &blocks, items, attempt)
                        .await
                }
            }
        };

        tokio::select! {
            _ = run.cancel.cancelled() => {
                Err(StageFailure::new(failure_kind::CANCELLED, "run cancelled"))
            }
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(result) => result,
                Err(_) => Err(StageFailure::new(
                    failure_kind::TIMEOUT,
                    format!("attempt did not finish within {}s", timeout.as_secs()),
                )),
            }
        }
    }

    /// Invoke the capability once per item, bounded by `max_parallel`, and
    /// aggregate each declared output into an index-ordered array.
    async fn dispatch_fan_out(
        &self,
        run: &StageRun,
        role: &RoleAssignment,
        inputs: &HashMap<String, Value>,
        blocks: &[ContextBlock],
        items: &[Value],
        attempt: u32,
    ) -> Result<HashMap<String, Value>, StageFailure> {
        let stage = &run.stage;
        let parallelism = stage
            .fan_out
            .as_ref()
            .and_then(|f| f.max_parallel)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_FAN_OUT_PARALLELISM)
            .max(1);

        let calls: Vec<CapabilityCall> = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut element_inputs = inputs.clone();
                element_inputs.insert("item".to_string(), item.clone());
                element_inputs.insert("index".to_string(), json!(index));
                self.build_call(run, role, element_inputs, blocks.to_vec(), attempt)
            })
            .collect();

        let mut futures = Vec::with_capacity(calls.len());
        for call in &calls {
            futures.push(self.registry.invoke(call));
        }
        let results: Vec<Result<_, _>> = stream::iter(futures)
            .buffered(parallelism)
            .collect()
            .await;

        let mut aggregated: HashMap<String, Vec<Value>> = stage
            .outputs
            .keys()
            .map(|name| (name.clone(), Vec::with_capacity(items.len())))
            .collect();

        for (index, result) in results.into_iter().enumerate() {
            let outcome = result
                .map_err(|e| StageFailure::new(e.kind, format!("item {index}: {}", e.message)))?;
            for (name, decl) in &stage.outputs {
                match outcome.outputs.get(name) {
                    Some(value) if decl.output_type.accepts(value) => {
                        if let Some(slot) = aggregated.get_mut(name) {
                            slot.push(value.clone());
                        }
                    }
                    Some(_) => {
                        return Err(StageFailure::new(
                            failure_kind::OUTPUT_CONTRACT,
                            format!(
                                "item {index}: output '{name}' is not a {}",
                                decl.output_type.as_str()
                            ),
                        ))
                    }
                    None if decl.required => {
                        return Err(StageFailure::new(
                            failure_kind::OUTPUT_CONTRACT,
                            format!("item {index}: required output '{name}' missing"),
                        ))
                    }
                    None => {
                        if let Some(slot) = aggregated.get_mut(name) {
                            slot.push(decl.default.clone().unwrap_or(Value::Null));
                        }
                    }
                }
            }
        }

        Ok(aggregated
            .into_iter()
            .map(|(name, values)| (name, Value::Array(values)))
            .collect())
    }

    fn build_call(
        &self,
        run: &StageRun,
        role: &RoleAssignment,
        inputs: HashMap<String, Value>,
        context: Vec<ContextBlock>,
        attempt: u32,
    ) -> CapabilityCall {
        CapabilityCall {
            run_id: run.run_id,
            stage_id: run.stage.id.clone(),
            capability: role.capability.clone(),
            model: role.model.clone(),
            instructions: role.instructions.clone(),
            tools: role.tools.clone(),
            inputs,
            context,
            attempt,
            cancel: run.cancel.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Input / output contracts
// ---------------------------------------------------------------------------

/// Resolve every declared input against the snapshot.
///
/// Required inputs that are unresolved or null raise `missing_input`;
/// optional ones are omitted from the resolved map.
fn resolve_inputs(
    stage: &StageDefinition,
    snapshot: &Value,
) -> Result<HashMap<String, Value>, StageFailure> {
    let mut resolved = HashMap::new();
    for (name, decl) in &stage.inputs {
        match template::evaluate_source(&decl.source, snapshot) {
            Ok(Value::Null) => {
                if decl.required {
                    return Err(StageFailure::new(
                        failure_kind::MISSING_INPUT,
                        format!("required input '{name}' resolved to null"),
                    ));
                }
            }
            Ok(value) => {
                if !decl.input_type.accepts(&value) {
                    return Err(StageFailure::new(
                        failure_kind::MISSING_INPUT,
                        format!("input '{name}' is not a {}", decl.input_type.as_str()),
                    ));
                }
                resolved.insert(name.clone(), value);
            }
            Err(e) if e.is_unresolved() => {
                if decl.required {
                    return Err(StageFailure::new(
                        failure_kind::MISSING_INPUT,
                        format!("required input '{name}': {e}"),
                    ));
                }
            }
            Err(e) => {
                return Err(StageFailure::new(
                    failure_kind::MISSING_INPUT,
                    format!("input '{name}': {e}"),
                ))
            }
        }
    }
    Ok(resolved)
}

/// Declared defaults contributed by a stage that is skipped or failed.
pub(crate) fn default_outputs(stage: &StageDefinition) -> HashMap<String, Value> {
    stage
        .outputs
        .iter()
        .filter_map(|(name, decl)| decl.default.clone().map(|value| (name.clone(), value)))
        .collect()
}

/// Enforce the declared output contract on a capability's result.
///
/// Missing optional outputs fall back to their defaults; a missing or
/// mistyped required output is a contract defect (never retried).
fn validate_outputs(
    stage: &StageDefinition,
    mut produced: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, StageFailure> {
    for (name, decl) in &stage.outputs {
        match produced.get(name) {
            Some(value) => {
                if !decl.output_type.accepts(value) {
                    return Err(StageFailure::new(
                        failure_kind::OUTPUT_CONTRACT,
                        format!("output '{name}' is not a {}", decl.output_type.as_str()),
                    ));
                }
            }
            None => {
                if let Some(default) = &decl.default {
                    produced.insert(name.clone(), default.clone());
                } else if decl.required {
                    return Err(StageFailure::new(
                        failure_kind::OUTPUT_CONTRACT,
                        format!("required output '{name}' missing"),
                    ));
                }
            }
        }
    }
    Ok(produced)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
