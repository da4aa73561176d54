//! Type coercion for `coerce` transforms.
//!
//! Null always coerces to null. Blank strings coerce to null for numeric and
//! date targets; any other unparsable input is an error, never a silent zero.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use naked_pineapple_core::CoerceType;
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use thiserror::Error;

/// A value that cannot be represented as the requested type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot coerce {value} to {target}: {reason}")]
pub struct CoercionError {
    /// Requested type.
    pub target: CoerceType,
    /// Offending value, JSON-encoded.
    pub value: String,
    /// What went wrong.
    pub reason: String,
}

impl CoercionError {
    fn new(target: CoerceType, value: &Value, reason: impl Into<String>) -> Self {
        let mut value = value.to_string();
        if value.len() > 100 {
            let cut = value
                .char_indices()
                .nth(100)
                .map_or(value.len(), |(i, _)| i);
            value.truncate(cut);
            value.push_str("...");
        }
        Self {
            target,
            value,
            reason: reason.into(),
        }
    }
}

const TRUE_WORDS: [&str; 5] = ["true", "1", "yes", "y", "on"];
const FALSE_WORDS: [&str; 6] = ["false", "0", "no", "n", "off", ""];

/// Convert `value` to `target`.
///
/// # Errors
///
/// Returns `CoercionError` when the value cannot be represented.
pub fn coerce(value: &Value, target: CoerceType) -> Result<Value, CoercionError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if is_blank(value) && !matches!(target, CoerceType::String | CoerceType::Boolean) {
        return Ok(Value::Null);
    }

    match target {
        CoerceType::String => Ok(Value::String(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        CoerceType::Int => to_int(value).map(Value::from),
        CoerceType::Float => {
            let n = to_float(value)?;
            Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| CoercionError::new(target, value, "not a finite number"))
        }
        CoerceType::Boolean => to_bool(value).map(Value::Bool),
        CoerceType::Decimal => to_decimal(value).map(|d| Value::String(d.to_string())),
        CoerceType::Bigint => to_bigint(value),
        CoerceType::Date => to_datetime(value, target)
            .map(|dt| Value::String(dt.date_naive().format("%Y-%m-%d").to_string())),
        CoerceType::Datetime => to_datetime(value, target)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))),
    }
}

fn is_blank(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.trim().is_empty())
}

fn to_float(value: &Value) -> Result<f64, CoercionError> {
    let target = CoerceType::Float;
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .ok_or_else(|| CoercionError::new(target, value, "not a number"))?;
    if n.is_finite() {
        Ok(n)
    } else {
        Err(CoercionError::new(target, value, "not a finite number"))
    }
}

fn to_int(value: &Value) -> Result<i64, CoercionError> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let n = to_float(value).map_err(|e| CoercionError {
        target: CoerceType::Int,
        ..e
    })?;
    #[allow(clippy::cast_precision_loss)]
    let in_range = n.trunc() >= i64::MIN as f64 && n.trunc() <= i64::MAX as f64;
    if !in_range {
        return Err(CoercionError::new(CoerceType::Int, value, "out of range"));
    }
    #[allow(clippy::cast_possible_truncation)]
    let truncated = n.trunc() as i64;
    Ok(truncated)
}

fn to_bool(value: &Value) -> Result<bool, CoercionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Ok(true),
            Some(x) if x == 0.0 => Ok(false),
            _ => Err(CoercionError::new(
                CoerceType::Boolean,
                value,
                "only 1 and 0 are boolean numbers",
            )),
        },
        Value::String(s) => {
            let word = s.trim().to_lowercase();
            if TRUE_WORDS.contains(&word.as_str()) {
                Ok(true)
            } else if FALSE_WORDS.contains(&word.as_str()) {
                Ok(false)
            } else {
                Err(CoercionError::new(
                    CoerceType::Boolean,
                    value,
                    "unrecognized boolean",
                ))
            }
        }
        _ => Err(CoercionError::new(
            CoerceType::Boolean,
            value,
            "unsupported type",
        )),
    }
}

fn to_decimal(value: &Value) -> Result<Decimal, CoercionError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => {
            return Err(CoercionError::new(
                CoerceType::Decimal,
                value,
                "unsupported type",
            ));
        }
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| CoercionError::new(CoerceType::Decimal, value, e.to_string()))
}

fn to_bigint(value: &Value) -> Result<Value, CoercionError> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(_) => to_int(value)
            .map(Value::from)
            .map_err(|e| CoercionError {
                target: CoerceType::Bigint,
                ..e
            }),
        Value::String(s) => {
            let s = s.trim();
            // `gid://shopify/Product/123` -> `123`
            let digits = s.rsplit_once('/').map_or(s, |(_, tail)| tail);
            let unsigned = digits.strip_prefix('-').unwrap_or(digits);
            if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CoercionError::new(
                    CoerceType::Bigint,
                    value,
                    "not an integer",
                ));
            }
            Ok(digits
                .parse::<i64>()
                .map_or_else(|_| Value::String(digits.to_string()), Value::from))
        }
        _ => Err(CoercionError::new(
            CoerceType::Bigint,
            value,
            "unsupported type",
        )),
    }
}

fn to_datetime(value: &Value, target: CoerceType) -> Result<DateTime<Utc>, CoercionError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| CoercionError::new(target, value, "invalid epoch milliseconds")),
        Value::String(s) => {
            parse_datetime(s.trim()).ok_or_else(|| CoercionError::new(target, value, "invalid date"))
        }
        _ => Err(CoercionError::new(target, value, "unsupported type")),
    }
}

/// Parse RFC 3339, naive date-times (assumed UTC) and plain dates.
#[must_use]
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
