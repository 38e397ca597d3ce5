//! `${{ ... }}` marker extraction and interpolation for document strings.
//!
//! Workflow documents embed expressions inside `${{ ... }}` markers. A string
//! that is exactly one marker evaluates to the expression's raw value (so an
//! input source can resolve to an object or array); a string mixing markers
//! with literal text interpolates each value into the surrounding text; a
//! string with no markers is a plain literal.

use serde_json::Value;

use super::{eval, parser, value_to_display, ExpressionError};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A `${{ ... }}` marker found in a string: byte span plus inner source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Byte offset of `${{`.
    pub start: usize,
    /// Byte offset just past `}}`.
    pub end: usize,
    /// Trimmed expression source between the delimiters.
    pub source: String,
}

/// Find every expression marker in a string, left to right.
///
/// An opening `${{` without a closing `}}` is an error.
pub fn markers(text: &str) -> Result<Vec<Marker>, ExpressionError> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find(OPEN) {
        let start = cursor + offset;
        let body_start = start + OPEN.len();
        let Some(close_offset) = text[body_start..].find(CLOSE) else {
            return Err(ExpressionError::UnterminatedMarker(text.to_string()));
        };
        let end = body_start + close_offset + CLOSE.len();
        found.push(Marker {
            start,
            end,
            source: text[body_start..body_start + close_offset].trim().to_string(),
        });
        cursor = end;
    }
    Ok(found)
}

/// Whether a string contains at least one expression marker.
pub fn has_markers(text: &str) -> bool {
    text.contains(OPEN)
}

/// Parse every embedded expression without evaluating (load-time check).
pub fn syntax_check(text: &str) -> Result<(), ExpressionError> {
    for marker in markers(text)? {
        parser::parse(&marker.source)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a document string against a context.
///
/// - No markers: the string itself, as a `Value::String`.
/// - Exactly one marker spanning the whole (trimmed) string: the raw value
///   of the expression.
/// - Markers mixed with text: interpolated `Value::String`.
pub fn evaluate_source(text: &str, context: &Value) -> Result<Value, ExpressionError> {
    let trimmed = text.trim();
    let found = markers(trimmed)?;
    if found.is_empty() {
        return Ok(Value::String(text.to_string()));
    }
    if found.len() == 1 && found[0].start == 0 && found[0].end == trimmed.len() {
        return eval::evaluate(&found[0].source, context);
    }
    interpolate(text, context).map(Value::String)
}

/// Replace every marker in a string with its evaluated display form.
pub fn interpolate(text: &str, context: &Value) -> Result<String, ExpressionError> {
    let found = markers(text)?;
    if found.is_empty() {
        return Ok(text.to_string());
    }
    let mut result = String::with_capacity(text.len());
    let mut cursor = 0;
    for marker in found {
        result.push_str(&text[cursor..marker.start]);
        let value = eval::evaluate(&marker.source, context)?;
        result.push_str(&value_to_display(&value));
        cursor = marker.end;
    }
    result.push_str(&text[cursor..]);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
