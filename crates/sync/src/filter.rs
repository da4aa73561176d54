//! Pre-transform record filters.
//!
//! Every filter must pass for a record to reach the transform engine; an
//! empty filter list passes everything. Regexes are compiled once per run.

use std::cmp::Ordering;
use std::str::FromStr;

use naked_pineapple_core::{Filter, FilterOperator};
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::record::{display_value, resolve, resolve_present};

/// Invalid filter configuration.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The `regex` operator's pattern does not compile.
    #[error("Invalid regex for filter on '{field}': {source}")]
    InvalidRegex {
        /// Filtered field.
        field: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// `in`/`not_in` need an array operand.
    #[error("Filter on '{field}' with operator {operator:?} requires an array value")]
    ExpectedArray {
        /// Filtered field.
        field: String,
        /// Offending operator.
        operator: FilterOperator,
    },
}

#[derive(Debug)]
struct CompiledFilter {
    field: String,
    operator: FilterOperator,
    value: Value,
    regex: Option<Regex>,
}

/// A mapping's filter chain, ready to evaluate.
#[derive(Debug, Default)]
pub struct CompiledFilters {
    filters: Vec<CompiledFilter>,
}

impl CompiledFilters {
    /// Validate and compile a filter list.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` for bad regexes or non-array `in`/`not_in` values.
    pub fn compile(filters: &[Filter]) -> Result<Self, FilterError> {
        let filters = filters
            .iter()
            .map(|f| {
                let regex = match f.operator {
                    FilterOperator::Regex => Some(
                        Regex::new(&display_value(&f.value)).map_err(|source| {
                            FilterError::InvalidRegex {
                                field: f.field.clone(),
                                source,
                            }
                        })?,
                    ),
                    FilterOperator::In | FilterOperator::NotIn if !f.value.is_array() => {
                        return Err(FilterError::ExpectedArray {
                            field: f.field.clone(),
                            operator: f.operator,
                        });
                    }
                    _ => None,
                };
                Ok(CompiledFilter {
                    field: f.field.clone(),
                    operator: f.operator,
                    value: f.value.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    /// Whether `record` passes every filter.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether there are no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl CompiledFilter {
    fn matches(&self, record: &Value) -> bool {
        let actual = resolve(record, &self.field).unwrap_or(&Value::Null);
        match self.operator {
            FilterOperator::Eq => loosely_equal(actual, &self.value),
            FilterOperator::Neq => !loosely_equal(actual, &self.value),
            FilterOperator::In => self.options().iter().any(|v| loosely_equal(actual, v)),
            FilterOperator::NotIn => !self.options().iter().any(|v| loosely_equal(actual, v)),
            FilterOperator::Exists => resolve_present(record, &self.field).is_some(),
            FilterOperator::NotExists => resolve_present(record, &self.field).is_none(),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match actual {
                Value::String(s) => s.contains(&display_value(&self.value)),
                Value::Array(items) => items.iter().any(|v| loosely_equal(v, &self.value)),
                _ => false,
            },
            FilterOperator::StartsWith => match actual {
                Value::String(s) => s.starts_with(&display_value(&self.value)),
                _ => false,
            },
            FilterOperator::Regex => match (actual, &self.regex) {
                (Value::Null, _) | (_, None) => false,
                (v, Some(re)) => re.is_match(&display_value(v)),
            },
        }
    }

    fn options(&self) -> &[Value] {
        self.value.as_array().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Numbers and numeric strings as `f64`.
pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// Numbers and numeric strings as an exact `Decimal`, when representable.
fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Orders two numeric values, exactly where both fit a `Decimal`.
fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_decimal(a), as_decimal(b)) {
        return Some(x.cmp(&y));
    }
    let (x, y) = (as_number(a)?, as_number(b)?);
    x.partial_cmp(&y)
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match numeric_cmp(a, b) {
            Some(ordering) => ordering == Ordering::Equal,
            None => a == b,
        },
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let Some(ordering) = numeric_cmp(a, b) {
        return Some(ordering);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
