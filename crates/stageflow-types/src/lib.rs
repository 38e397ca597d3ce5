//! Shared domain types for Stageflow.
//!
//! This crate contains the canonical workflow intermediate representation
//! (`WorkflowDefinition` and friends) and the run-state types mutated during
//! execution (`RunState`, `StageRecord`).
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono.

pub mod run;
pub mod workflow;
