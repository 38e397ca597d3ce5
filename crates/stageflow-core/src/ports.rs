//! Port traits for the engine's external collaborators.
//!
//! The engine defines these seams; embedders implement them (dependency
//! inversion, same pattern as a repository trait implemented by an
//! infrastructure layer). All traits are object-safe -- the coordinator
//! holds `Arc<dyn Port>` -- so methods return boxed futures.
//!
//! The engine treats every port call as opaque: possibly long-running,
//! possibly failing, cancellable only cooperatively.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde_json::Value;
use stageflow_types::workflow::{HookAction, MemoryQueryPolicy};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Capability registry
// ---------------------------------------------------------------------------

/// A fully resolved request to execute a stage's capability.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub run_id: Uuid,
    pub stage_id: String,
    /// Capability reference (agent or skill identifier).
    pub capability: String,
    /// Optional model override from the role assignment.
    pub model: Option<String>,
    /// Optional instructions from the role assignment.
    pub instructions: Option<String>,
    /// Auxiliary capability references.
    pub tools: Vec<String>,
    /// Resolved input values.
    pub inputs: HashMap<String, Value>,
    /// Injected context content.
    pub context: Vec<ContextBlock>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cooperative cancellation signal; implementations should honor it.
    pub cancel: CancellationToken,
}

/// Named outputs returned by a successful capability execution.
#[derive(Debug, Clone, Default)]
pub struct CapabilityOutcome {
    pub outputs: HashMap<String, Value>,
}

/// A failed capability execution.
///
/// `kind` is a stable tag matched against a retry policy's
/// `non_retryable_errors` list.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct CapabilityFailure {
    pub kind: String,
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Executes the work behind a stage's role reference.
pub trait CapabilityRegistry: Send + Sync {
    /// Execute the capability and return its named outputs.
    fn invoke<'a>(
        &'a self,
        call: &'a CapabilityCall,
    ) -> BoxFuture<'a, Result<CapabilityOutcome, CapabilityFailure>>;
}

// ---------------------------------------------------------------------------
// Context / memory provider
// ---------------------------------------------------------------------------

/// A block of resolved context content, keyed by its module id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlock {
    pub module: String,
    pub content: String,
}

/// Context resolution failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("context resolution failed: {0}")]
pub struct ContextError(pub String);

/// Resolves context modules and memory queries into injectable text.
pub trait ContextProvider: Send + Sync {
    fn resolve<'a>(
        &'a self,
        modules: &'a [String],
        memory: Option<&'a MemoryQueryPolicy>,
    ) -> BoxFuture<'a, Result<Vec<ContextBlock>, ContextError>>;
}

// ---------------------------------------------------------------------------
// Approval sink
// ---------------------------------------------------------------------------

/// A gate stage presented to human approvers.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub run_id: Uuid,
    pub stage_id: String,
    pub approvers: Vec<String>,
    /// Message with expressions already interpolated.
    pub message: Option<String>,
}

/// The decision returned by the approval sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved {
        approver: Option<String>,
    },
    Rejected {
        approver: Option<String>,
        reason: Option<String>,
    },
}

/// Approval transport failure (the gate's timeout is owned by the engine).
#[derive(Debug, Clone, thiserror::Error)]
#[error("approval request failed: {0}")]
pub struct ApprovalError(pub String);

/// Presents gate stages to approvers and returns their decision.
pub trait ApprovalSink: Send + Sync {
    fn request<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> BoxFuture<'a, Result<ApprovalDecision, ApprovalError>>;
}

// ---------------------------------------------------------------------------
// Hook sink
// ---------------------------------------------------------------------------

/// Which lifecycle moment a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Start,
    Complete,
    Failure,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::Start => "on_start",
            HookEvent::Complete => "on_complete",
            HookEvent::Failure => "on_failure",
        }
    }
}

/// Hook delivery failure. Logged and swallowed -- never affects the run.
#[derive(Debug, Clone, thiserror::Error)]
#[error("hook delivery failed: {0}")]
pub struct HookDeliveryError(pub String);

/// Receives dispatched hook payloads (chat notification, paging, analytics).
pub trait HookSink: Send + Sync {
    /// Deliver one action block; `action.with` is already interpolated.
    fn deliver<'a>(
        &'a self,
        event: HookEvent,
        action: &'a HookAction,
    ) -> BoxFuture<'a, Result<(), HookDeliveryError>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
