//! Run-state types: the single mutable entity tracking one workflow execution.
//!
//! `RunState` is created when a run starts, mutated exclusively by the run
//! coordinator (stage tasks report results but never write here directly),
//! and frozen once the run reaches a terminal status. Stage statuses are
//! monotonic: a terminal status is never overwritten.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of an individual stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::Skipped
                | StageStatus::Cancelled
        )
    }

    /// The snake_case tag used in events and expression contexts.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::WaitingApproval => "waiting_approval",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Aborted by an `on_failure: halt` directive, a halting gate timeout,
    /// or the run-wide timeout.
    Halted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Halted | RunStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Stage failure
// ---------------------------------------------------------------------------

/// Stable snake_case tags for engine-generated failure kinds.
///
/// These are the values matched against a retry policy's
/// `non_retryable_errors` list. Capabilities may report their own tags.
pub mod failure_kind {
    pub const TIMEOUT: &str = "timeout";
    pub const MISSING_INPUT: &str = "missing_input";
    pub const CONDITION_EVALUATION: &str = "condition_evaluation";
    pub const OUTPUT_CONTRACT: &str = "output_contract";
    pub const GATE_REJECTED: &str = "gate_rejected";
    pub const GATE_TIMEOUT: &str = "gate_timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const RUNNER_EXECUTION: &str = "runner_execution";
}

/// A recorded stage failure: a stable kind tag plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Failure kind tag (see [`failure_kind`]).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Stage record
// ---------------------------------------------------------------------------

/// Per-stage execution record within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current stage status.
    pub status: StageStatus,
    /// Resolved outputs (populated on success; declared defaults on skip/fail).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, Value>,
    /// Attempt counter (1-based; 0 until the first dispatch).
    pub attempts: u32,
    /// Recorded failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            outputs: HashMap::new(),
            attempts: 0,
            failure: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// The single mutable entity for one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// UUIDv7 run id.
    pub id: Uuid,
    /// Id of the workflow definition being executed.
    pub workflow_id: String,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// Bound parameter values (defaults applied).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Per-stage execution records keyed by stage id.
    pub stages: HashMap<String, StageRecord>,
    /// Index of the batch currently being processed.
    pub current_batch: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage that triggered a halt, if the run was halted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<String>,
    /// Run-level error message, if the run failed or halted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Create a fresh run with every listed stage in `Pending`.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        parameters: HashMap<String, Value>,
        stage_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            parameters,
            stages: stage_ids
                .into_iter()
                .map(|id| (id, StageRecord::default()))
                .collect(),
            current_batch: 0,
            started_at: Utc::now(),
            completed_at: None,
            halted_by: None,
            error: None,
        }
    }

    /// Get a stage record by id.
    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.get(id)
    }

    /// Current status of a stage (`None` for unknown ids).
    pub fn stage_status(&self, id: &str) -> Option<StageStatus> {
        self.stages.get(id).map(|r| r.status)
    }

    /// Transition a stage to `status`, enforcing terminal monotonicity.
    ///
    /// Returns `false` (and leaves the record untouched) when the stage is
    /// unknown or already terminal. Timestamps are maintained: the first
    /// departure from `Pending` stamps `started_at`, reaching a terminal
    /// status stamps `completed_at`.
    pub fn set_stage_status(&mut self, id: &str, status: StageStatus) -> bool {
        let Some(record) = self.stages.get_mut(id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        if record.status == StageStatus::Pending && status != StageStatus::Pending {
            record.started_at.get_or_insert_with(Utc::now);
        }
        record.status = status;
        if status.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        true
    }

    /// Whether every stage has reached a terminal status.
    pub fn all_stages_terminal(&self) -> bool {
        self.stages.values().all(|r| r.status.is_terminal())
    }

    /// Overall success: every stage succeeded or was skipped.
    pub fn overall_success(&self) -> bool {
        self.stages
            .values()
            .all(|r| matches!(r.status, StageStatus::Succeeded | StageStatus::Skipped))
    }

    /// Ids of stages currently in the given status.
    pub fn stages_in(&self, status: StageStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stages
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Final map of stage id to resolved outputs.
    pub fn outputs(&self) -> HashMap<String, HashMap<String, Value>> {
        self.stages
            .iter()
            .map(|(id, r)| (id.clone(), r.outputs.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> RunState {
        RunState::new(
            "release-pipeline",
            "Release Pipeline",
            HashMap::from([("env".to_string(), json!("staging"))]),
            ["build".to_string(), "deploy".to_string()],
        )
    }

    // -----------------------------------------------------------------------
    // Status predicates
    // -----------------------------------------------------------------------

    #[test]
    fn test_stage_status_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Cancelled.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(!StageStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Halted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    // -----------------------------------------------------------------------
    // Monotonic transitions
    // -----------------------------------------------------------------------

    #[test]
    fn test_terminal_status_is_never_overwritten() {
        let mut run = sample_run();
        assert!(run.set_stage_status("build", StageStatus::Running));
        assert!(run.set_stage_status("build", StageStatus::Succeeded));

        // Any further transition is refused.
        assert!(!run.set_stage_status("build", StageStatus::Failed));
        assert_eq!(run.stage_status("build"), Some(StageStatus::Succeeded));
    }

    #[test]
    fn test_unknown_stage_transition_refused() {
        let mut run = sample_run();
        assert!(!run.set_stage_status("nope", StageStatus::Running));
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut run = sample_run();
        assert!(run.stage("build").unwrap().started_at.is_none());

        run.set_stage_status("build", StageStatus::Running);
        assert!(run.stage("build").unwrap().started_at.is_some());
        assert!(run.stage("build").unwrap().completed_at.is_none());

        run.set_stage_status("build", StageStatus::Succeeded);
        assert!(run.stage("build").unwrap().completed_at.is_some());
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    #[test]
    fn test_overall_success_requires_all_succeeded_or_skipped() {
        let mut run = sample_run();
        run.set_stage_status("build", StageStatus::Succeeded);
        run.set_stage_status("deploy", StageStatus::Skipped);
        assert!(run.all_stages_terminal());
        assert!(run.overall_success());

        let mut failed = sample_run();
        failed.set_stage_status("build", StageStatus::Succeeded);
        failed.set_stage_status("deploy", StageStatus::Failed);
        assert!(failed.all_stages_terminal());
        assert!(!failed.overall_success());
    }

    #[test]
    fn test_stages_in_filters_by_status() {
        let mut run = sample_run();
        run.set_stage_status("build", StageStatus::Running);
        assert_eq!(run.stages_in(StageStatus::Running), vec!["build"]);
        assert_eq!(run.stages_in(StageStatus::Pending), vec!["deploy"]);
    }

    // -----------------------------------------------------------------------
    // Serde roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_run_state_json_roundtrip() {
        let mut run = sample_run();
        run.set_stage_status("build", StageStatus::Running);
        run.stages.get_mut("build").unwrap().outputs =
            HashMap::from([("artifact".to_string(), json!("img:1"))]);
        run.stages.get_mut("build").unwrap().failure =
            Some(StageFailure::new(failure_kind::TIMEOUT, "attempt 1 timed out"));

        let json_str = serde_json::to_string(&run).unwrap();
        let parsed: RunState = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.workflow_id, "release-pipeline");
        assert_eq!(parsed.stage_status("build"), Some(StageStatus::Running));
        assert_eq!(
            parsed.stage("build").unwrap().failure.as_ref().unwrap().kind,
            "timeout"
        );
    }

    #[test]
    fn test_stage_status_serde_tags() {
        assert_eq!(
            serde_json::to_string(&StageStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
        assert_eq!(StageStatus::WaitingApproval.as_str(), "waiting_approval");
    }

    #[test]
    fn test_stage_failure_display() {
        let failure = StageFailure::new(failure_kind::MISSING_INPUT, "input 'target' undefined");
        assert_eq!(failure.to_string(), "[missing_input] input 'target' undefined");
    }
}
