//! Observability wiring for Stageflow: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
