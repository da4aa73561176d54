//! Tree-walking interpreter over `serde_json::Value`.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ExpressionError;
use super::parser::{BinaryOp, Expr, UnaryOp};
use crate::filter::as_number;
use crate::record::{display_value, resolve};

/// Names visible to a formula.
///
/// Lookup order: alias, then `value` (the primary input), then a dotted path
/// into the record. Unknown names evaluate to null.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    record: &'a Value,
    value: &'a Value,
    aliases: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> Scope<'a> {
    /// Scope over a record with a null primary value and no aliases.
    #[must_use]
    pub const fn new(record: &'a Value) -> Self {
        Self {
            record,
            value: &Value::Null,
            aliases: None,
        }
    }

    /// Bind `value`.
    #[must_use]
    pub const fn with_value(mut self, value: &'a Value) -> Self {
        self.value = value;
        self
    }

    /// Bind multi-source aliases.
    #[must_use]
    pub const fn with_aliases(mut self, aliases: &'a BTreeMap<String, Value>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    fn lookup(&self, name: &str) -> Value {
        if let Some(v) = self.aliases.and_then(|a| a.get(name)) {
            return v.clone();
        }
        if name == "value" {
            return self.value.clone();
        }
        resolve(self.record, name).cloned().unwrap_or(Value::Null)
    }
}

/// Wrap an `f64` result, preferring an integer representation.
///
/// # Errors
///
/// Returns `ExpressionError::NonFinite` for NaN or infinities.
pub fn number_value(n: f64) -> Result<Value, ExpressionError> {
    if !n.is_finite() {
        return Err(ExpressionError::NonFinite);
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        let int = n as i64;
        return Ok(Value::from(int));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or(ExpressionError::NonFinite)
}

/// Numeric view of an operand: numbers, numeric strings, booleans as 1/0.
///
/// # Errors
///
/// Returns `ExpressionError::Type` for anything else, including null.
pub fn to_number(value: &Value, context: &str) -> Result<f64, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        v => as_number(v).ok_or_else(|| {
            ExpressionError::Type(format!("{context}: expected a number, got {}", kind(v)))
        }),
    }
}

/// Whether a value is non-null and not blank.
#[must_use]
pub fn truthy_string(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => false,
            }
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<bool, ExpressionError> {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            let x = to_number(a, "comparison")?;
            let y = to_number(b, "comparison")?;
            x.partial_cmp(&y)
                .ok_or_else(|| ExpressionError::Type("cannot compare NaN".to_string()))?
        }
    };
    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExpressionError> {
    if op == BinaryOp::Add && (a.is_string() || b.is_string()) {
        return Ok(Value::String(format!(
            "{}{}",
            display_value(a),
            display_value(b)
        )));
    }
    let symbol = match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        _ => "%",
    };
    let x = to_number(a, symbol)?;
    let y = to_number(b, symbol)?;
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    number_value(result)
}

/// Evaluate an expression tree.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(scope.lookup(name)),
        Expr::Unary { op, expr } => {
            let v = evaluate(expr, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => number_value(-to_number(&v, "-")?),
            }
        }
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                let l = evaluate(lhs, scope)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&evaluate(rhs, scope)?)))
            }
            BinaryOp::Or => {
                let l = evaluate(lhs, scope)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&evaluate(rhs, scope)?)))
            }
            _ => {
                let l = evaluate(lhs, scope)?;
                let r = evaluate(rhs, scope)?;
                match op {
                    BinaryOp::Eq => Ok(Value::Bool(loosely_equal(&l, &r))),
                    BinaryOp::NotEq => Ok(Value::Bool(!loosely_equal(&l, &r))),
                    BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                        compare(*op, &l, &r).map(Value::Bool)
                    }
                    _ => arithmetic(*op, &l, &r),
                }
            }
        },
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            if truthy(&evaluate(condition, scope)?) {
                evaluate(then, scope)
            } else {
                evaluate(otherwise, scope)
            }
        }
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            function.call(&values)
        }
    }
}
