//! The embedded expression language for workflow documents.
//!
//! Expressions appear inside `${{ ... }}` markers in conditions, input
//! sources, fan-out item selectors, and hook payloads. The language is
//! deliberately small: property paths, comparisons, boolean logic, a ternary
//! operator, and four built-in functions (`length`, `contains`, `toJSON`,
//! `fromJSON`).
//!
//! Evaluation is a pure function of (expression, context): identical inputs
//! always yield identical results, with no observable side effects.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use eval::{evaluate, truthy};
pub use parser::{parse, Expr};

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    /// The expression text does not conform to the grammar.
    #[error("parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    /// The first path segment does not name a context namespace.
    #[error("unknown namespace '{namespace}'")]
    UnknownNamespace { namespace: String },

    /// A later path segment could not be resolved.
    #[error("unresolved path '{path}'")]
    UnresolvedPath { path: String },

    /// An operator was applied to incompatible operand types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Call to a function that is not one of the builtins.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// A builtin was called with a wrong arity or argument type.
    #[error("bad argument to {function}: {message}")]
    BadArgument { function: String, message: String },

    /// `fromJSON` received text that is not valid JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// A `${{` marker without a matching `}}`.
    #[error("unterminated expression marker in {0:?}")]
    UnterminatedMarker(String),
}

impl ExpressionError {
    /// Whether this error means "the referenced value does not exist",
    /// as opposed to a structural or typing problem.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ExpressionError::UnknownNamespace { .. } | ExpressionError::UnresolvedPath { .. }
        )
    }
}

/// Render a value for interpolation into surrounding text.
///
/// Strings are inserted bare; other values render as compact JSON.
pub(crate) fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
