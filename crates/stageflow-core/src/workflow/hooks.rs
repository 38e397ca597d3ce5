//! Lifecycle hook dispatch: payload interpolation and best-effort delivery.
//!
//! Hook action blocks are opaque to the engine except for one rule: string
//! fields anywhere in the `with` payload may embed `${{ ... }}` expressions,
//! interpolated against the final run context before dispatch. Interpolation
//! and delivery failures are logged and swallowed -- hooks never affect the
//! run outcome.

use std::sync::Arc;

use serde_json::Value;
use stageflow_types::workflow::HookAction;

use crate::expr::template;
use crate::ports::{HookEvent, HookSink};

// ---------------------------------------------------------------------------
// HookDispatcher
// ---------------------------------------------------------------------------

/// Delivers lifecycle hook actions through the configured sink.
#[derive(Clone)]
pub struct HookDispatcher {
    sink: Arc<dyn HookSink>,
}

impl HookDispatcher {
    pub fn new(sink: Arc<dyn HookSink>) -> Self {
        Self { sink }
    }

    /// Resolve and deliver every action block for one lifecycle event.
    pub async fn dispatch(&self, event: HookEvent, actions: &[HookAction], context: &Value) {
        for action in actions {
            let resolved = resolve_action(action, context);
            if let Err(e) = self.sink.deliver(event, &resolved).await {
                tracing::warn!(
                    hook = action.name.as_str(),
                    event = event.as_str(),
                    error = %e,
                    "hook delivery failed"
                );
            }
        }
    }
}

/// Interpolate every string field in an action's `with` payload.
fn resolve_action(action: &HookAction, context: &Value) -> HookAction {
    HookAction {
        name: action.name.clone(),
        action: action.action.clone(),
        with: action
            .with
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(action, value, context)))
            .collect(),
    }
}

fn resolve_value(action: &HookAction, value: &Value, context: &Value) -> Value {
    match value {
        Value::String(text) => match template::evaluate_source(text, context) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(
                    hook = action.name.as_str(),
                    error = %e,
                    "hook payload interpolation failed, passing raw text"
                );
                value.clone()
            }
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(action, item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_value(action, item, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
