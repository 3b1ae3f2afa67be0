//! Expression evaluation seam
//!
//! The engine never interprets expressions itself. Every attribute of an
//! action definition is an expression handed to an [`Evaluator`] together with
//! the calling thread's variable scope.

use std::collections::BTreeMap;

use crate::errors::EvalError;
use crate::types::Value;

/// Variables visible to an expression
pub type Scope = BTreeMap<String, Value>;

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError>;
}

/// Render a value the way result variables and messages show it
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness of a value
pub fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Treat a value as a list: arrays are spread, `None` is empty, anything else
/// is a single item
pub fn to_list(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Minimal evaluator: literals and variable references
///
/// Accepts `None`, `True`/`False`, JSON literals, single-quoted strings and
/// variable names. Anything else is an evaluation error.
#[derive(Debug, Default, Clone)]
pub struct VariableEvaluator;

impl VariableEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for VariableEvaluator {
    fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError> {
        let expr = expr.trim();

        match expr {
            "None" => return Ok(Value::Null),
            "True" => return Ok(Value::Bool(true)),
            "False" => return Ok(Value::Bool(false)),
            _ => {}
        }

        if expr.len() >= 2 && expr.starts_with('\'') && expr.ends_with('\'') {
            return Ok(Value::String(expr[1..expr.len() - 1].to_string()));
        }

        if is_identifier(expr) {
            return scope
                .get(expr)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(expr.to_string()));
        }

        serde_json::from_str(expr).map_err(|e| EvalError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
    }
}

fn is_identifier(expr: &str) -> bool {
    let mut chars = expr.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(expr, "true" | "false" | "null")
}
