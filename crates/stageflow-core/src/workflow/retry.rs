//! Retry policy merging, exponential backoff, and retry/give-up decisions.
//!
//! Stateless: all logic lives in free functions taking the configuration as
//! parameters. Attempt counting is 1-based -- the first execution is
//! attempt 1, and the delay after a failed attempt *n* is
//! `min(initial_interval * backoff_multiplier^(n-1), max_interval)`.

use std::time::Duration;

use stageflow_types::run::{failure_kind, StageFailure};
use stageflow_types::workflow::{ErrorPolicy, ErrorPolicyOverride, OnFailure, RetryPolicy};

// ---------------------------------------------------------------------------
// Effective policy
// ---------------------------------------------------------------------------

/// The error policy in force for one stage after overrides are applied.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub retry: Option<RetryPolicy>,
    pub on_failure: OnFailure,
}

/// Merge the workflow default with a stage-level override, field by field.
///
/// An unset override field inherits the workflow default.
pub fn effective_policy(
    defaults: &ErrorPolicy,
    stage_override: Option<&ErrorPolicyOverride>,
) -> EffectivePolicy {
    let retry = stage_override
        .and_then(|o| o.retry.clone())
        .or_else(|| defaults.default_retry.clone());
    let on_failure = stage_override
        .and_then(|o| o.on_failure)
        .unwrap_or(defaults.on_stage_failure);
    EffectivePolicy { retry, on_failure }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The outcome of consulting the retry engine after a stage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the stage after the given backoff delay.
    Retry { delay: Duration },
    /// Retries are exhausted or not applicable; apply the directive.
    GiveUp { directive: OnFailure },
}

/// Decide what to do about a stage failure.
///
/// Failure kinds that are intrinsically non-retryable skip the retry policy
/// entirely: an output-contract defect signals a capability mismatch, gate
/// decisions are deterministic resolutions, expression evaluation is
/// referentially transparent against the attempt's immutable snapshot, and
/// cancellation is final.
pub fn decide(policy: &EffectivePolicy, failure: &StageFailure, attempts: u32) -> RetryDecision {
    if never_retryable(&failure.kind) {
        return RetryDecision::GiveUp {
            directive: policy.on_failure,
        };
    }
    let Some(retry) = &policy.retry else {
        return RetryDecision::GiveUp {
            directive: policy.on_failure,
        };
    };
    if retry
        .non_retryable_errors
        .iter()
        .any(|tag| tag == &failure.kind)
    {
        return RetryDecision::GiveUp {
            directive: policy.on_failure,
        };
    }
    if attempts < retry.max_attempts {
        RetryDecision::Retry {
            delay: backoff_delay(retry, attempts),
        }
    } else {
        RetryDecision::GiveUp {
            directive: policy.on_failure,
        }
    }
}

/// Failure kinds that no policy may retry.
fn never_retryable(kind: &str) -> bool {
    matches!(
        kind,
        failure_kind::OUTPUT_CONTRACT
            | failure_kind::MISSING_INPUT
            | failure_kind::CONDITION_EVALUATION
            | failure_kind::GATE_REJECTED
            | failure_kind::GATE_TIMEOUT
            | failure_kind::CANCELLED
    )
}

/// Backoff delay after a failed attempt (1-based), capped at `max_interval`.
pub fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = retry.backoff_multiplier.powi(exponent as i32);
    let raw = (retry.initial_interval_secs as f64) * factor;
    let capped = raw.min(retry.max_interval_secs as f64);
    Duration::from_secs_f64(capped.max(0.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
