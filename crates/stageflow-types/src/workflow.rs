//! Workflow domain types for Stageflow.
//!
//! Defines the canonical intermediate representation for workflow documents:
//! the YAML surface and any programmatic builder both convert to and from
//! `WorkflowDefinition`. The definition is immutable once loaded -- the
//! engine only ever reads it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Mirrors the top-level sections of the declarative document:
/// `workflow`, `config`, `context`, `stages`, `error_policy`, `hooks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Identity and presentation metadata.
    pub workflow: WorkflowMeta,
    /// Parameters, run timeout, and environment.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Workflow-level context policy (global modules + memory query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPolicy>,
    /// Ordered list of stage definitions forming the workflow DAG.
    pub stages: Vec<StageDefinition>,
    /// Default error policy, overridable per stage.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Lifecycle hook action blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookConfig>,
}

impl WorkflowDefinition {
    /// Look up a stage definition by id.
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// Identity block of a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    /// Stable workflow id (slug: alphanumeric, hyphens, underscores).
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.2.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Presentation metadata. Carried through round-trips, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
}

/// The `config` section: parameter schema, run timeout, environment map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Parameter schema keyed by parameter name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, ParameterSpec>,
    /// Run-wide timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Environment map exposed to expressions under the `env` namespace.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Declaration of a single workflow parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Declared value type.
    #[serde(rename = "type", default)]
    pub param_type: DeclaredType,
    /// Whether a binding (or default) must be present at run start.
    #[serde(default)]
    pub required: bool,
    /// Default value applied when no binding is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared type for parameters, inputs, and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl DeclaredType {
    /// Whether a JSON value is compatible with this declared type.
    ///
    /// `null` is never compatible with a concrete type; use `Any` for
    /// nullable declarations.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            DeclaredType::String => value.is_string(),
            DeclaredType::Number => value.is_number(),
            DeclaredType::Boolean => value.is_boolean(),
            DeclaredType::Object => value.is_object(),
            DeclaredType::Array => value.is_array(),
            DeclaredType::Any => true,
        }
    }

    /// The snake_case name used in documents and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclaredType::String => "string",
            DeclaredType::Number => "number",
            DeclaredType::Boolean => "boolean",
            DeclaredType::Object => "object",
            DeclaredType::Array => "array",
            DeclaredType::Any => "any",
        }
    }
}

// ---------------------------------------------------------------------------
// Context policy
// ---------------------------------------------------------------------------

/// Context policy: which knowledge modules to inject and how to query memory.
///
/// Appears at workflow level and as a per-stage override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPolicy {
    /// Identifiers of context modules to resolve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    /// Memory query policy, if memory should be consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryQueryPolicy>,
}

/// How the external memory provider should be queried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQueryPolicy {
    /// Memory scope (e.g. "project", "global").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Minimum confidence threshold for returned entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    /// Category filter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Token budget for injected content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// Stage Definition
// ---------------------------------------------------------------------------

/// A single stage in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// User-defined stage id (e.g. "build-artifact"). Unique within a workflow.
    pub id: String,
    /// Human-readable stage name.
    #[serde(default)]
    pub name: String,
    /// The kind of stage.
    #[serde(rename = "type")]
    pub stage_type: StageType,
    /// Stage ids this stage depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional condition expression; absent means the stage always runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Capability assignment. Required for `agent` and `fan_out` stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleAssignment>,
    /// Gate configuration. Required iff `type: gate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateConfig>,
    /// Fan-out configuration. Required iff `type: fan_out`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<FanOutConfig>,
    /// Input declarations keyed by input name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputDeclaration>,
    /// Output declarations keyed by output name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, OutputDeclaration>,
    /// Per-attempt timeout in seconds (else a type-specific default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Field-by-field override of the workflow error policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicyOverride>,
    /// Stage-level context policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPolicy>,
    /// Post-execution output packaging policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffPolicy>,
    /// Presentation metadata. Carried through round-trips, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
}

/// The kind of stage in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Dispatch a capability once with resolved inputs.
    Agent,
    /// Suspend pending an external approval decision.
    Gate,
    /// Dispatch a capability once per element of an item collection.
    FanOut,
}

/// The external capability assigned to a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Capability reference (agent or skill identifier).
    pub capability: String,
    /// Optional model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional extra instructions for the capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Auxiliary capability references available to the primary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// Configuration for a `gate` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Who may approve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    /// How long to wait for a decision before `on_timeout` applies.
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
    /// What an elapsed timeout resolves to.
    #[serde(default)]
    pub on_timeout: GateTimeoutAction,
    /// Message shown to approvers. May embed expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_gate_timeout() -> u64 {
    3600
}

/// Resolution applied when a gate's approval window elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTimeoutAction {
    /// Fail the gate and halt the whole run, regardless of `on_failure`.
    #[default]
    Halt,
    /// Treat the elapsed window as approval.
    AutoApprove,
    /// Treat the elapsed window as rejection.
    Reject,
}

/// Configuration for a `fan_out` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Expression producing the item collection (must evaluate to an array).
    pub items: String,
    /// Upper bound on concurrently executing items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

/// Declaration of a single stage input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDeclaration {
    /// Declared value type.
    #[serde(rename = "type", default)]
    pub input_type: DeclaredType,
    /// Source expression evaluated against the run context.
    pub source: String,
    /// Whether the stage fails (`missing_input`) when the source is undefined.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declaration of a single stage output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDeclaration {
    /// Declared value type.
    #[serde(rename = "type", default)]
    pub output_type: DeclaredType,
    /// Whether the capability must produce this output.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value contributed when the stage is skipped or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// How a stage's output is packaged for dependents and observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffPolicy {
    #[serde(default)]
    pub mode: HandoffMode,
    /// Free-form note forwarded alongside the outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Handoff packaging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffMode {
    /// Pass the full output map through.
    #[default]
    Full,
    /// Pass outputs plus a condensed summary entry.
    Summary,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// Workflow-level error handling defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Default retry policy applied to stage failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
    /// What happens once a stage failure is final.
    #[serde(default)]
    pub on_stage_failure: OnFailure,
}

/// Stage-level partial override of the workflow error policy.
///
/// An unset field inherits the workflow default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<OnFailure>,
}

/// Retry configuration for stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds (default 30).
    #[serde(default = "default_initial_interval")]
    pub initial_interval_secs: u64,
    /// Multiplier applied to the delay on each subsequent retry (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on the delay, in seconds (default 300).
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    /// Failure kind tags that skip retry and go straight to `on_failure`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_secs: default_initial_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_secs: default_max_interval(),
            non_retryable_errors: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_interval() -> u64 {
    300
}

/// What happens when a stage failure is final (retries exhausted or skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the run; remaining pending stages become cancelled.
    #[default]
    Halt,
    /// Fail only this stage; independent stages proceed.
    Continue,
    /// Fail this stage and skip its transitive dependents.
    SkipDependents,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Lifecycle hook action blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    /// Fired before batch 0.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_start: Vec<HookAction>,
    /// Fired when the run succeeds overall.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<HookAction>,
    /// Fired on halt or unrecoverable failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<HookAction>,
}

/// A single opaque hook action block.
///
/// String fields in `with` may embed `${{ ... }}` expressions; the dispatcher
/// interpolates them against the final run context before delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookAction {
    /// Human-readable action name.
    pub name: String,
    /// Sink-side action identifier (e.g. "slack.post").
    pub action: String,
    /// Opaque payload forwarded to the sink.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub with: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
