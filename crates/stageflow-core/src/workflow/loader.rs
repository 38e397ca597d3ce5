//! Workflow document parsing, overlay merging, and structural validation.
//!
//! Converts between YAML documents and the canonical `WorkflowDefinition` IR.
//! Validation is fail-fast and ordered: shape, id uniqueness, reference
//! integrity, cycle detection, value validity, variant payloads, expression
//! syntax. Every error carries enough identifying context (stage id, field
//! name) to pinpoint the offending declaration.

use std::collections::HashSet;

use serde_json::Value;
use stageflow_types::workflow::{StageDefinition, StageType, WorkflowDefinition};
use thiserror::Error;

use crate::expr::{template, ExpressionError};

use super::graph::StageGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow document.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// YAML/JSON deserialization failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure while loading or saving a document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Workflow id is not a valid slug.
    #[error("workflow id '{0}' is not a valid slug (alphanumeric, '-', '_')")]
    InvalidWorkflowId(String),

    /// Workflow version is not valid semver.
    #[error("workflow version '{version}' is not valid semver: {message}")]
    InvalidVersion { version: String, message: String },

    /// A workflow must declare at least one stage.
    #[error("workflow must declare at least one stage")]
    NoStages,

    /// Two stages share an id.
    #[error("duplicate stage id '{0}'")]
    DuplicateStageId(String),

    /// A `depends_on` entry references a nonexistent stage.
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("circular dependency among stages {members:?}")]
    CircularDependency { members: Vec<String> },

    /// A field holds an out-of-range or malformed value.
    #[error("stage '{stage}': invalid {field}: {message}")]
    InvalidValue {
        stage: String,
        field: String,
        message: String,
    },

    /// A parameter declaration or default is inconsistent.
    #[error("parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    /// A gate stage without a `gate` block.
    #[error("gate stage '{0}' is missing its gate configuration")]
    MissingGateConfig(String),

    /// A fan_out stage without a `fan_out` block.
    #[error("fan_out stage '{0}' is missing its fan_out configuration")]
    MissingFanOutConfig(String),

    /// An agent or fan_out stage without a role assignment.
    #[error("{stage_type} stage '{stage}' requires a role assignment")]
    MissingRole { stage: String, stage_type: String },

    /// A configuration block that does not belong to the stage's type.
    #[error("stage '{stage}' ({stage_type}) does not take a {field} block")]
    UnexpectedConfig {
        stage: String,
        stage_type: String,
        field: String,
    },

    /// An embedded expression failed to parse.
    #[error("stage '{stage}': expression in {field} does not parse: {source}")]
    InvalidExpression {
        stage: String,
        field: String,
        source: ExpressionError,
    },

    /// A hook payload embeds an unparseable expression.
    #[error("hook '{hook}': expression does not parse: {source}")]
    InvalidHookExpression {
        hook: String,
        source: ExpressionError,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, SchemaError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| SchemaError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a base document merged with a partial project-level overlay.
///
/// Maps merge recursively (overlay keys win); scalars and arrays replace.
/// The merge happens on the raw document, before deserialization and
/// validation.
pub fn parse_with_overlay(
    base_yaml: &str,
    overlay_yaml: &str,
) -> Result<WorkflowDefinition, SchemaError> {
    let mut base: Value =
        serde_yaml_ng::from_str(base_yaml).map_err(|e| SchemaError::Parse(e.to_string()))?;
    let overlay: Value =
        serde_yaml_ng::from_str(overlay_yaml).map_err(|e| SchemaError::Parse(e.to_string()))?;
    merge_values(&mut base, overlay);
    let def: WorkflowDefinition =
        serde_json::from_value(base).map_err(|e| SchemaError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` back to YAML.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, SchemaError> {
    serde_yaml_ng::to_string(def).map_err(|e| SchemaError::Parse(e.to_string()))
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &std::path::Path) -> Result<WorkflowDefinition, SchemaError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(
    path: &std::path::Path,
    def: &WorkflowDefinition,
) -> Result<(), SchemaError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow_yaml(def)?)?;
    Ok(())
}

/// Deep-merge `overlay` into `base`: objects merge key-wise, everything else
/// is replaced by the overlay value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Applied in order, stopping at the first violation:
/// 1. workflow id slug, semver version, parameter defaults
/// 2. stage id uniqueness
/// 3. `depends_on` reference integrity
/// 4. cycle detection
/// 5. numeric/value validity (retry, timeouts, fan-out bounds)
/// 6. variant payloads (gate/role/fan_out presence)
/// 7. embedded expression syntax
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), SchemaError> {
    // (1) identity
    if def.workflow.id.is_empty()
        || !def
            .workflow
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SchemaError::InvalidWorkflowId(def.workflow.id.clone()));
    }
    semver::Version::parse(&def.workflow.version).map_err(|e| SchemaError::InvalidVersion {
        version: def.workflow.version.clone(),
        message: e.to_string(),
    })?;

    for (name, spec) in &def.config.parameters {
        if let Some(default) = &spec.default {
            if !spec.param_type.accepts(default) {
                return Err(SchemaError::InvalidParameter {
                    name: name.clone(),
                    message: format!(
                        "default value does not match declared type '{}'",
                        spec.param_type.as_str()
                    ),
                });
            }
        }
    }

    if def.stages.is_empty() {
        return Err(SchemaError::NoStages);
    }

    // (2) unique stage ids
    let mut seen = HashSet::new();
    for stage in &def.stages {
        if !seen.insert(stage.id.as_str()) {
            return Err(SchemaError::DuplicateStageId(stage.id.clone()));
        }
    }

    // (3) reference integrity
    for stage in &def.stages {
        for dep in &stage.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(SchemaError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // (4) cycle detection
    StageGraph::build(&def.stages)?.batches()?;

    // (5) value validity
    if let Some(retry) = &def.error_policy.default_retry {
        validate_retry(retry, "workflow")?;
    }
    if def.config.timeout_secs == Some(0) {
        return Err(SchemaError::InvalidValue {
            stage: "<workflow>".to_string(),
            field: "config.timeout_secs".to_string(),
            message: "timeout must be > 0".to_string(),
        });
    }
    for stage in &def.stages {
        if stage.timeout_secs == Some(0) {
            return Err(SchemaError::InvalidValue {
                stage: stage.id.clone(),
                field: "timeout_secs".to_string(),
                message: "timeout must be > 0".to_string(),
            });
        }
        if let Some(policy) = &stage.error_policy {
            if let Some(retry) = &policy.retry {
                validate_retry(retry, &stage.id)?;
            }
        }
        if let Some(fan_out) = &stage.fan_out {
            if fan_out.max_parallel == Some(0) {
                return Err(SchemaError::InvalidValue {
                    stage: stage.id.clone(),
                    field: "fan_out.max_parallel".to_string(),
                    message: "must be >= 1".to_string(),
                });
            }
        }
        if let Some(gate) = &stage.gate {
            if gate.timeout_secs == 0 {
                return Err(SchemaError::InvalidValue {
                    stage: stage.id.clone(),
                    field: "gate.timeout_secs".to_string(),
                    message: "timeout must be > 0".to_string(),
                });
            }
        }
    }

    // (6) variant payloads
    for stage in &def.stages {
        validate_variant(stage)?;
    }

    // (7) expression syntax
    for stage in &def.stages {
        if let Some(condition) = &stage.condition {
            check_expression(&stage.id, "condition", condition)?;
        }
        for (name, input) in &stage.inputs {
            check_expression(&stage.id, &format!("inputs.{name}.source"), &input.source)?;
        }
        if let Some(fan_out) = &stage.fan_out {
            check_expression(&stage.id, "fan_out.items", &fan_out.items)?;
        }
        if let Some(gate) = &stage.gate {
            if let Some(message) = &gate.message {
                check_expression(&stage.id, "gate.message", message)?;
            }
        }
    }
    if let Some(hooks) = &def.hooks {
        for (event, actions) in [
            ("on_start", &hooks.on_start),
            ("on_complete", &hooks.on_complete),
            ("on_failure", &hooks.on_failure),
        ] {
            for action in actions {
                for value in action.with.values() {
                    check_hook_value(&format!("{event}.{}", action.name), value)?;
                }
            }
        }
    }

    Ok(())
}

fn validate_retry(
    retry: &stageflow_types::workflow::RetryPolicy,
    stage: &str,
) -> Result<(), SchemaError> {
    if retry.max_attempts == 0 {
        return Err(SchemaError::InvalidValue {
            stage: stage.to_string(),
            field: "retry.max_attempts".to_string(),
            message: "must be >= 1".to_string(),
        });
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(SchemaError::InvalidValue {
            stage: stage.to_string(),
            field: "retry.backoff_multiplier".to_string(),
            message: "must be >= 1.0".to_string(),
        });
    }
    if retry.max_interval_secs < retry.initial_interval_secs {
        return Err(SchemaError::InvalidValue {
            stage: stage.to_string(),
            field: "retry.max_interval_secs".to_string(),
            message: "must be >= initial_interval_secs".to_string(),
        });
    }
    Ok(())
}

fn validate_variant(stage: &StageDefinition) -> Result<(), SchemaError> {
    let type_name = match stage.stage_type {
        StageType::Agent => "agent",
        StageType::Gate => "gate",
        StageType::FanOut => "fan_out",
    };
    match stage.stage_type {
        StageType::Agent => {
            if stage.role.is_none() {
                return Err(SchemaError::MissingRole {
                    stage: stage.id.clone(),
                    stage_type: type_name.to_string(),
                });
            }
            reject_config(stage, type_name, "gate", stage.gate.is_some())?;
            reject_config(stage, type_name, "fan_out", stage.fan_out.is_some())?;
        }
        StageType::Gate => {
            if stage.gate.is_none() {
                return Err(SchemaError::MissingGateConfig(stage.id.clone()));
            }
            reject_config(stage, type_name, "role", stage.role.is_some())?;
            reject_config(stage, type_name, "fan_out", stage.fan_out.is_some())?;
        }
        StageType::FanOut => {
            if stage.role.is_none() {
                return Err(SchemaError::MissingRole {
                    stage: stage.id.clone(),
                    stage_type: type_name.to_string(),
                });
            }
            if stage.fan_out.is_none() {
                return Err(SchemaError::MissingFanOutConfig(stage.id.clone()));
            }
            reject_config(stage, type_name, "gate", stage.gate.is_some())?;
        }
    }
    Ok(())
}

fn reject_config(
    stage: &StageDefinition,
    type_name: &str,
    field: &str,
    present: bool,
) -> Result<(), SchemaError> {
    if present {
        return Err(SchemaError::UnexpectedConfig {
            stage: stage.id.clone(),
            stage_type: type_name.to_string(),
            field: field.to_string(),
        });
    }
    Ok(())
}

fn check_expression(stage: &str, field: &str, text: &str) -> Result<(), SchemaError> {
    template::syntax_check(text).map_err(|source| SchemaError::InvalidExpression {
        stage: stage.to_string(),
        field: field.to_string(),
        source,
    })
}

/// Walk a hook payload value; every embedded string expression must parse.
fn check_hook_value(hook: &str, value: &Value) -> Result<(), SchemaError> {
    match value {
        Value::String(text) => {
            template::syntax_check(text).map_err(|source| SchemaError::InvalidHookExpression {
                hook: hook.to_string(),
                source,
            })
        }
        Value::Array(items) => {
            for item in items {
                check_hook_value(hook, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                check_hook_value(hook, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
