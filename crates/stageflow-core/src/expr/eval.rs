//! Tree-walking evaluator over `serde_json::Value`.
//!
//! Evaluation is pure and deterministic: the same expression against the
//! same context always produces the same value. Truthiness follows
//! JavaScript-like coercion rules; `&&`/`||` short-circuit.

use serde_json::Value;

use super::parser::{parse, BinaryOp, Expr, UnaryOp};
use super::ExpressionError;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse and evaluate expression source against a context object.
///
/// The context must be a JSON object whose top-level keys are the
/// namespaces (`parameters`, `stages`, `context`, `env`, `run`, `workflow`).
pub fn evaluate(source: &str, context: &Value) -> Result<Value, ExpressionError> {
    let expr = parse(source)?;
    eval_expr(&expr, context)
}

/// Evaluate an already-parsed expression tree.
pub fn eval_expr(expr: &Expr, context: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => resolve_path(segments, context),
        Expr::Unary { op, operand } => {
            let value = eval_expr(operand, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, context),
        Expr::Ternary {
            condition,
            then_branch,
            else_branch,
        } => {
            let selected = if truthy(&eval_expr(condition, context)?) {
                then_branch
            } else {
                else_branch
            };
            eval_expr(selected, context)
        }
        Expr::Call { function, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, context)?);
            }
            call_builtin(function, values)
        }
    }
}

/// JavaScript-like truthiness: `null`, `false`, `0`, and `""` are falsy;
/// everything else (including empty arrays/objects) is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

fn resolve_path(segments: &[String], context: &Value) -> Result<Value, ExpressionError> {
    let Some(root) = context.as_object() else {
        return Err(ExpressionError::TypeMismatch(
            "expression context is not an object".to_string(),
        ));
    };

    let namespace = &segments[0];
    let mut current = root
        .get(namespace.as_str())
        .ok_or_else(|| ExpressionError::UnknownNamespace {
            namespace: namespace.clone(),
        })?;

    for segment in &segments[1..] {
        current = current.get(segment.as_str()).ok_or_else(|| {
            ExpressionError::UnresolvedPath {
                path: segments.join("."),
            }
        })?;
    }
    Ok(current.clone())
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    context: &Value,
) -> Result<Value, ExpressionError> {
    // Short-circuit forms evaluate the right side lazily.
    match op {
        BinaryOp::Or => {
            let left = eval_expr(lhs, context)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            let right = eval_expr(rhs, context)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        BinaryOp::And => {
            let left = eval_expr(lhs, context)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            let right = eval_expr(rhs, context)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        _ => {}
    }

    let left = eval_expr(lhs, context)?;
    let right = eval_expr(rhs, context)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Or | BinaryOp::And => unreachable!(),
    }
}

/// Equality with cross-format numeric normalization (`1 == 1.0`).
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

/// Relational comparison: two numbers or two strings.
fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r).ok_or_else(|| {
                ExpressionError::TypeMismatch("cannot order NaN".to_string())
            })
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (l, r) => Err(ExpressionError::TypeMismatch(format!(
            "cannot compare {} with {}",
            kind_name(l),
            kind_name(r)
        ))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

fn call_builtin(function: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
    match function {
        "length" => {
            let [value] = take_args::<1>("length", args)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExpressionError::BadArgument {
                        function: "length".to_string(),
                        message: format!("expected string, array, or object, got {}", kind_name(other)),
                    })
                }
            };
            Ok(Value::from(len as u64))
        }
        "contains" => {
            let [container, item] = take_args::<2>("contains", args)?;
            let found = match &container {
                Value::String(s) => match &item {
                    Value::String(needle) => s.contains(needle.as_str()),
                    other => {
                        return Err(ExpressionError::BadArgument {
                            function: "contains".to_string(),
                            message: format!(
                                "substring search needs a string, got {}",
                                kind_name(other)
                            ),
                        })
                    }
                },
                Value::Array(items) => items.iter().any(|v| values_equal(v, &item)),
                Value::Object(map) => match &item {
                    Value::String(key) => map.contains_key(key.as_str()),
                    other => {
                        return Err(ExpressionError::BadArgument {
                            function: "contains".to_string(),
                            message: format!("object key must be a string, got {}", kind_name(other)),
                        })
                    }
                },
                other => {
                    return Err(ExpressionError::BadArgument {
                        function: "contains".to_string(),
                        message: format!(
                            "expected string, array, or object container, got {}",
                            kind_name(other)
                        ),
                    })
                }
            };
            Ok(Value::Bool(found))
        }
        "toJSON" => {
            let [value] = take_args::<1>("toJSON", args)?;
            let text = serde_json::to_string(&value)
                .map_err(|e| ExpressionError::TypeMismatch(e.to_string()))?;
            Ok(Value::String(text))
        }
        "fromJSON" => {
            let [value] = take_args::<1>("fromJSON", args)?;
            let Value::String(text) = value else {
                return Err(ExpressionError::BadArgument {
                    function: "fromJSON".to_string(),
                    message: format!("expected a string, got {}", kind_name(&value)),
                });
            };
            serde_json::from_str(&text).map_err(|e| ExpressionError::MalformedJson(e.to_string()))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn take_args<const N: usize>(
    function: &str,
    args: Vec<Value>,
) -> Result<[Value; N], ExpressionError> {
    let found = args.len();
    args.try_into().map_err(|_| ExpressionError::BadArgument {
        function: function.to_string(),
        message: format!("expected {N} argument(s), got {found}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
