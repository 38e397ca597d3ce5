//! Run context: accumulated stage results and expression-context snapshots.
//!
//! `RunContext` collects what a run has produced so far (stage outputs and
//! statuses, bound parameters, environment, injected context blocks) and
//! renders it into the JSON object expressions evaluate against. Snapshots
//! are taken at dispatch time and never mutated while a batch's concurrent
//! evaluations are in flight.

use std::collections::HashMap;

use serde_json::{json, Value};
use stageflow_types::run::StageStatus;
use uuid::Uuid;

use crate::ports::ContextBlock;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single stage's output map (1 MB).
pub const MAX_STAGE_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Accumulated evaluation state for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    workflow_id: String,
    workflow_name: String,
    workflow_version: String,
    run_id: Uuid,
    parameters: HashMap<String, Value>,
    env: HashMap<String, String>,
    context_blocks: Vec<ContextBlock>,
    stage_outputs: HashMap<String, HashMap<String, Value>>,
    stage_statuses: HashMap<String, StageStatus>,
}

impl RunContext {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        run_id: Uuid,
        parameters: HashMap<String, Value>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            run_id,
            parameters,
            env,
            context_blocks: Vec::new(),
            stage_outputs: HashMap::new(),
            stage_statuses: HashMap::new(),
        }
    }

    /// Install the resolved workflow-level context blocks.
    pub fn set_context_blocks(&mut self, blocks: Vec<ContextBlock>) {
        self.context_blocks = blocks;
    }

    /// Record a stage's status and outputs.
    ///
    /// Outputs whose serialized size exceeds [`MAX_STAGE_OUTPUT_SIZE`] are
    /// replaced with a truncation marker so one oversized stage cannot grow
    /// the context without bound.
    pub fn record_stage(
        &mut self,
        stage_id: &str,
        status: StageStatus,
        outputs: &HashMap<String, Value>,
    ) {
        self.stage_statuses.insert(stage_id.to_string(), status);

        let size = serde_json::to_string(outputs).map(|s| s.len()).unwrap_or(0);
        if size > MAX_STAGE_OUTPUT_SIZE {
            tracing::warn!(
                stage_id,
                size,
                max = MAX_STAGE_OUTPUT_SIZE,
                "stage output exceeds size limit, truncating"
            );
            let truncated = HashMap::from([(
                "_truncated".to_string(),
                json!({
                    "original_size": size,
                    "message": format!(
                        "output exceeded {MAX_STAGE_OUTPUT_SIZE} byte limit and was truncated"
                    ),
                }),
            )]);
            self.stage_outputs.insert(stage_id.to_string(), truncated);
        } else {
            self.stage_outputs
                .insert(stage_id.to_string(), outputs.clone());
        }
    }

    /// Outputs recorded for a stage, if any.
    pub fn stage_outputs(&self, stage_id: &str) -> Option<&HashMap<String, Value>> {
        self.stage_outputs.get(stage_id)
    }

    /// Build the JSON object expressions evaluate against.
    ///
    /// Namespaces: `parameters`, `stages` (id -> `{outputs, status}`),
    /// `context` (module -> content), `env`, `run`, `workflow`.
    pub fn to_expression_context(&self) -> Value {
        let mut stages = serde_json::Map::new();
        for (id, status) in &self.stage_statuses {
            let outputs = self
                .stage_outputs
                .get(id)
                .map(|o| json!(o))
                .unwrap_or_else(|| json!({}));
            stages.insert(
                id.clone(),
                json!({ "outputs": outputs, "status": status.as_str() }),
            );
        }

        let mut context = serde_json::Map::new();
        for block in &self.context_blocks {
            context.insert(block.module.clone(), Value::String(block.content.clone()));
        }

        json!({
            "parameters": self.parameters,
            "stages": stages,
            "context": context,
            "env": self.env,
            "run": { "id": self.run_id.to_string() },
            "workflow": {
                "id": self.workflow_id,
                "name": self.workflow_name,
                "version": self.workflow_version,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
