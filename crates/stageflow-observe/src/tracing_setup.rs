//! Tracing subscriber initialization for the workflow engine.
//!
//! Installs a structured `fmt` layer (human-readable or JSON) and, when
//! requested, bridges tracing spans to OpenTelemetry with a stdout exporter
//! (swap for OTLP in production).
//!
//! # Usage
//!
//! ```no_run
//! use stageflow_observe::tracing_setup::{init_tracing, TelemetryConfig};
//!
//! init_tracing(TelemetryConfig {
//!     json: false,
//!     otel: true,
//! })
//! .unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the OTel tracer provider reachable for a clean shutdown on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How the engine's telemetry should be wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryConfig {
    /// Emit log lines as JSON instead of the human-readable format.
    pub json: bool,
    /// Bridge tracing spans to OpenTelemetry (stdout exporter).
    pub otel: bool,
}

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG` via `EnvFilter::from_default_env()`. Span close
/// events are always recorded so batch and stage durations show up in the
/// log stream.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt_layer);

    if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stageflow");

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// Safe to call when OTel was never enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
