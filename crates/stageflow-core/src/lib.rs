//! Workflow orchestration engine for Stageflow.
//!
//! This crate is the "brain" of the platform:
//! - `expr` -- the embedded `${{ ... }}` expression language (lexer, parser,
//!   evaluator, template interpolation)
//! - `workflow` -- schema loading and validation, dependency graph batching,
//!   stage execution, retry policies, the run coordinator, and lifecycle hooks
//! - `ports` -- trait seams for the external collaborators (capability
//!   registry, context/memory provider, approval sink, hook sink)
//!
//! The engine defines the ports; embedders implement them. It never performs
//! capability work, persistence, or delivery itself.

pub mod expr;
pub mod ports;
pub mod workflow;
