//! Allow-listed formula functions.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::ExpressionError;
use super::eval::{number_value, to_number, truthy_string};
use crate::record::display_value;

/// Every function a formula may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    ToUpperCase,
    ToLowerCase,
    Trim,
    Substring,
    Split,
    Join,
    Replace,
    Contains,
    StartsWith,
    EndsWith,
    Length,
    Concat,
    Round,
    Floor,
    Ceil,
    Abs,
    Min,
    Max,
    ToNumber,
    ToString,
    IfNull,
    IfEmpty,
    Coalesce,
    ParseSkuUnits,
}

impl Function {
    /// Resolve a function by its formula name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "toUpperCase" => Self::ToUpperCase,
            "toLowerCase" => Self::ToLowerCase,
            "trim" => Self::Trim,
            "substring" => Self::Substring,
            "split" => Self::Split,
            "join" => Self::Join,
            "replace" => Self::Replace,
            "contains" => Self::Contains,
            "startsWith" => Self::StartsWith,
            "endsWith" => Self::EndsWith,
            "length" => Self::Length,
            "concat" => Self::Concat,
            "round" => Self::Round,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "toNumber" => Self::ToNumber,
            "toString" => Self::ToString,
            "ifNull" => Self::IfNull,
            "ifEmpty" => Self::IfEmpty,
            "coalesce" => Self::Coalesce,
            "parseSkuUnits" => Self::ParseSkuUnits,
            _ => return None,
        })
    }

    /// Formula name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ToUpperCase => "toUpperCase",
            Self::ToLowerCase => "toLowerCase",
            Self::Trim => "trim",
            Self::Substring => "substring",
            Self::Split => "split",
            Self::Join => "join",
            Self::Replace => "replace",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Length => "length",
            Self::Concat => "concat",
            Self::Round => "round",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::ToNumber => "toNumber",
            Self::ToString => "toString",
            Self::IfNull => "ifNull",
            Self::IfEmpty => "ifEmpty",
            Self::Coalesce => "coalesce",
            Self::ParseSkuUnits => "parseSkuUnits",
        }
    }

    /// `(min, max)` argument counts; `None` means variadic.
    const fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::ToUpperCase
            | Self::ToLowerCase
            | Self::Trim
            | Self::Length
            | Self::Floor
            | Self::Ceil
            | Self::Abs
            | Self::ToNumber
            | Self::ToString
            | Self::ParseSkuUnits => (1, Some(1)),
            Self::Substring => (2, Some(3)),
            Self::Split
            | Self::Contains
            | Self::StartsWith
            | Self::EndsWith
            | Self::IfNull
            | Self::IfEmpty => (2, Some(2)),
            Self::Join | Self::Round => (1, Some(2)),
            Self::Replace => (3, Some(3)),
            Self::Concat | Self::Min | Self::Max | Self::Coalesce => (1, None),
        }
    }

    /// Reject calls with the wrong number of arguments.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Arity`.
    pub fn check_arity(self, got: usize) -> Result<(), ExpressionError> {
        let (min, max) = self.arity();
        if got >= min && max.is_none_or(|max| got <= max) {
            return Ok(());
        }
        let expected = match max {
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{min}-{max}"),
            None => format!("at least {min}"),
        };
        Err(ExpressionError::Arity {
            name: self.name().to_string(),
            expected,
            got,
        })
    }

    /// Apply the function to evaluated arguments.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Type` for unusable arguments.
    pub fn call(self, args: &[Value]) -> Result<Value, ExpressionError> {
        let arg = |i: usize| args.get(i).unwrap_or(&Value::Null);

        match self {
            Self::ToUpperCase => Ok(map_string(arg(0), |s| s.to_uppercase())),
            Self::ToLowerCase => Ok(map_string(arg(0), |s| s.to_lowercase())),
            Self::Trim => Ok(map_string(arg(0), |s| s.trim().to_string())),
            Self::Substring => substring(arg(0), arg(1), args.get(2)),
            Self::Split => Ok(match arg(0) {
                Value::Null => Value::Null,
                v => Value::Array(
                    display_value(v)
                        .split(display_value(arg(1)).as_str())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                ),
            }),
            Self::Join => {
                let separator = args.get(1).map_or_else(|| ",".to_string(), display_value);
                match arg(0) {
                    Value::Array(items) => Ok(Value::String(
                        items
                            .iter()
                            .map(display_value)
                            .collect::<Vec<_>>()
                            .join(&separator),
                    )),
                    Value::Null => Ok(Value::Null),
                    other => Ok(Value::String(display_value(other))),
                }
            }
            Self::Replace => Ok(map_string(arg(0), |s| {
                let from = display_value(arg(1));
                if from.is_empty() {
                    s.to_string()
                } else {
                    s.replace(&from, &display_value(arg(2)))
                }
            })),
            Self::Contains => Ok(Value::Bool(match arg(0) {
                Value::Array(items) => items.contains(arg(1)),
                Value::Null => false,
                v => display_value(v).contains(&display_value(arg(1))),
            })),
            Self::StartsWith => Ok(Value::Bool(
                !arg(0).is_null() && display_value(arg(0)).starts_with(&display_value(arg(1))),
            )),
            Self::EndsWith => Ok(Value::Bool(
                !arg(0).is_null() && display_value(arg(0)).ends_with(&display_value(arg(1))),
            )),
            Self::Length => Ok(Value::from(match arg(0) {
                Value::Null => 0,
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                v => display_value(v).chars().count(),
            })),
            Self::Concat => Ok(Value::String(args.iter().map(display_value).collect())),
            Self::Round => {
                let n = to_number(arg(0), "round")?;
                let digits = match args.get(1) {
                    Some(d) => to_number(d, "round")?,
                    None => 0.0,
                };
                let factor = 10f64.powf(digits.trunc());
                number_value((n * factor).round() / factor)
            }
            Self::Floor => number_value(to_number(arg(0), "floor")?.floor()),
            Self::Ceil => number_value(to_number(arg(0), "ceil")?.ceil()),
            Self::Abs => number_value(to_number(arg(0), "abs")?.abs()),
            Self::Min | Self::Max => {
                let mut best: Option<f64> = None;
                for v in args.iter().filter(|v| !v.is_null()) {
                    let n = to_number(v, self.name())?;
                    best = Some(best.map_or(n, |b| {
                        if self == Self::Min { b.min(n) } else { b.max(n) }
                    }));
                }
                best.map_or(Ok(Value::Null), number_value)
            }
            Self::ToNumber => match arg(0) {
                Value::Null => Ok(Value::Null),
                v => number_value(to_number(v, "toNumber")?),
            },
            Self::ToString => Ok(match arg(0) {
                Value::Null => Value::Null,
                v => Value::String(display_value(v)),
            }),
            Self::IfNull => Ok(if arg(0).is_null() {
                arg(1).clone()
            } else {
                arg(0).clone()
            }),
            Self::IfEmpty => Ok(if truthy_string(arg(0)) {
                arg(0).clone()
            } else {
                arg(1).clone()
            }),
            Self::Coalesce => Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null)),
            Self::ParseSkuUnits => Ok(Value::from(parse_sku_units(&display_value(arg(0))))),
        }
    }
}

fn map_string(value: &Value, f: impl FnOnce(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        v => Value::String(f(&display_value(v))),
    }
}

fn substring(value: &Value, start: &Value, end: Option<&Value>) -> Result<Value, ExpressionError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let chars: Vec<char> = display_value(value).chars().collect();
    let len = chars.len();
    let clamp = |n: f64| -> usize {
        if n.is_nan() || n <= 0.0 {
            0
        } else {
            // Truncation to a char index is intended.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let idx = n as usize;
            idx.min(len)
        }
    };
    let mut from = clamp(to_number(start, "substring")?);
    let mut to = match end {
        Some(e) if !e.is_null() => clamp(to_number(e, "substring")?),
        _ => len,
    };
    if from > to {
        std::mem::swap(&mut from, &mut to);
    }
    Ok(Value::String(
        chars.get(from..to).unwrap_or_default().iter().collect(),
    ))
}

static SKU_PACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*-?\s*(?:pk|pack|ct|count)\b").expect("Invalid regex")
});
static SKU_TIMES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*x\b").expect("Invalid regex"));
static SKU_X_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bx\s*(\d+)\b").expect("Invalid regex"));
static SKU_CASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)case\s*-?\s*(\d+)").expect("Invalid regex"));
static SKU_TRAILING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)$").expect("Invalid regex"));

/// Units per SKU, read from pack-size conventions (`12pk`, `6-pack`,
/// `24ct`, `4x`, `x4`, `case12`, trailing `-6`). Defaults to 1.
#[must_use]
pub fn parse_sku_units(sku: &str) -> u64 {
    let sku = sku.trim();
    [
        &*SKU_PACK_RE,
        &*SKU_TIMES_RE,
        &*SKU_X_PREFIX_RE,
        &*SKU_CASE_RE,
        &*SKU_TRAILING_RE,
    ]
    .iter()
    .find_map(|re| {
        re.captures(sku)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .filter(|n| *n > 0)
    })
    .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        Function::lookup(name).unwrap().call(args).unwrap()
    }

    #[test]
    fn test_sku_units() {
        assert_eq!(parse_sku_units("TEA-GRN-12pk"), 12);
        assert_eq!(parse_sku_units("tea 6-Pack"), 6);
        assert_eq!(parse_sku_units("CUP24CT"), 24);
        assert_eq!(parse_sku_units("SODA-4x"), 4);
        assert_eq!(parse_sku_units("SODA x8"), 8);
        assert_eq!(parse_sku_units("CASE12-MUG"), 12);
        assert_eq!(parse_sku_units("MUG-RED-3"), 3);
        assert_eq!(parse_sku_units("MUG-RED"), 1);
        assert_eq!(parse_sku_units(""), 1);
        assert_eq!(parse_sku_units("ITEM-0"), 1);
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("toUpperCase", &[json!("tea")]), json!("TEA"));
        assert_eq!(call("trim", &[json!("  x ")]), json!("x"));
        assert_eq!(call("toLowerCase", &[Value::Null]), Value::Null);
        assert_eq!(call("substring", &[json!("pineapple"), json!(4)]), json!("apple"));
        assert_eq!(
            call("substring", &[json!("pineapple"), json!(0), json!(4)]),
            json!("pine")
        );
        assert_eq!(call("split", &[json!("a,b"), json!(",")]), json!(["a", "b"]));
        assert_eq!(call("join", &[json!(["a", "b"]), json!("|")]), json!("a|b"));
        assert_eq!(
            call("replace", &[json!("a-b-c"), json!("-"), json!("/")]),
            json!("a/b/c")
        );
        assert_eq!(call("length", &[json!("héllo")]), json!(5));
        assert_eq!(call("concat", &[json!("a"), json!(1), Value::Null]), json!("a1"));
    }

    #[test]
    fn test_predicates() {
        assert_eq!(call("contains", &[json!(["x", "y"]), json!("y")]), json!(true));
        assert_eq!(call("contains", &[json!("teapot"), json!("pot")]), json!(true));
        assert_eq!(call("startsWith", &[json!("NP-1"), json!("NP")]), json!(true));
        assert_eq!(call("endsWith", &[Value::Null, json!("")]), json!(false));
    }

    #[test]
    fn test_numeric_functions() {
        assert_eq!(call("round", &[json!(2.346), json!(2)]), json!(2.35));
        assert_eq!(call("round", &[json!("2.5")]), json!(3));
        assert_eq!(call("floor", &[json!(2.9)]), json!(2));
        assert_eq!(call("abs", &[json!(-4)]), json!(4));
        assert_eq!(call("min", &[json!(3), json!("1"), Value::Null]), json!(1));
        assert_eq!(call("max", &[json!(3), json!(7.5)]), json!(7.5));
        assert_eq!(call("toNumber", &[json!(" 42 ")]), json!(42));
        assert!(Function::ToNumber.call(&[json!("abc")]).is_err());
    }

    #[test]
    fn test_null_coalescing() {
        assert_eq!(call("ifNull", &[Value::Null, json!("d")]), json!("d"));
        assert_eq!(call("ifNull", &[json!(0), json!("d")]), json!(0));
        assert_eq!(call("ifEmpty", &[json!("  "), json!("d")]), json!("d"));
        assert_eq!(call("ifEmpty", &[json!("x"), json!("d")]), json!("x"));
        assert_eq!(
            call("coalesce", &[Value::Null, Value::Null, json!(3)]),
            json!(3)
        );
    }

    #[test]
    fn test_arity_messages() {
        let err = Function::Replace.check_arity(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function 'replace' expects 3 arguments, got 1"
        );
        assert!(Function::Concat.check_arity(9).is_ok());
        assert!(Function::Round.check_arity(3).is_err());
    }
}
