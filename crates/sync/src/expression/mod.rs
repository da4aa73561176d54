//! Sandboxed formula language for `expression` transforms.
//!
//! Formulas are compiled once per batch into an AST and interpreted against
//! a [`Scope`]. Only the allow-listed functions in [`functions`] can be
//! called; there is no way to reach the host environment.
//!
//! ```text
//! price * 1.2
//! ifEmpty(vendor, 'Unknown') + ' / ' + toUpperCase(title)
//! totalInventory > 0 ? 'in_stock' : 'sold_out'
//! price / parseSkuUnits(sku)
//! ```

mod eval;
pub mod functions;
mod lexer;
mod parser;

pub use eval::Scope;

use serde_json::Value;
use thiserror::Error;

use parser::{Expr, Parser};

/// Longest formula accepted by [`Expression::compile`].
pub const MAX_FORMULA_LENGTH: usize = 500;

/// Formula compilation or evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Formula is {len} characters; the maximum is {max}")]
    TooLong { len: usize, max: usize },

    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Result is not a finite number")]
    NonFinite,

    #[error("Type error: {0}")]
    Type(String),
}

/// A compiled formula.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse and validate a formula.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError` for over-long formulas, syntax errors,
    /// unknown functions and wrong argument counts.
    pub fn compile(formula: &str) -> Result<Self, ExpressionError> {
        let len = formula.chars().count();
        if len > MAX_FORMULA_LENGTH {
            return Err(ExpressionError::TooLong {
                len,
                max: MAX_FORMULA_LENGTH,
            });
        }
        let tokens = lexer::tokenize(formula)?;
        let ast = Parser::new(tokens).parse()?;
        Ok(Self {
            source: formula.to_string(),
            ast,
        })
    }

    /// Evaluate against a scope.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError` for type errors, division by zero and
    /// non-finite results.
    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        eval::evaluate(&self.ast, scope)
    }

    /// Names the formula reads.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.ast.identifiers(&mut out);
        out
    }

    /// Original formula text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn eval(formula: &str, record: &Value) -> Result<Value, ExpressionError> {
        Expression::compile(formula)?.evaluate(&Scope::new(record))
    }

    #[test]
    fn test_arithmetic_on_numeric_strings() {
        let record = json!({ "price": "2.5", "qty": 3 });
        assert_eq!(eval("price * qty", &record).unwrap(), json!(7.5));
        assert_eq!(eval("qty % 2", &record).unwrap(), json!(1));
        assert_eq!(eval("-qty + 10", &record).unwrap(), json!(7));
    }

    #[test]
    fn test_plus_concatenates_with_strings() {
        let record = json!({ "vendor": "Acme", "n": 2 });
        assert_eq!(eval("vendor + ' #' + n", &record).unwrap(), json!("Acme #2"));
        assert_eq!(eval("1 + 2 + 'x'", &record).unwrap(), json!("3x"));
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let record = json!({ "a": 4, "b": 0 });
        assert_eq!(
            eval("a / b", &record).unwrap_err(),
            ExpressionError::DivisionByZero
        );
        assert_eq!(
            eval("a % 0", &record).unwrap_err(),
            ExpressionError::DivisionByZero
        );
    }

    #[test]
    fn test_null_arithmetic_is_a_type_error() {
        assert!(matches!(
            eval("missing * 2", &json!({})),
            Err(ExpressionError::Type(_))
        ));
    }

    #[test]
    fn test_logic_and_ternary() {
        let record = json!({ "totalInventory": 0, "status": "ACTIVE" });
        assert_eq!(
            eval("totalInventory > 0 ? 'in_stock' : 'sold_out'", &record).unwrap(),
            json!("sold_out")
        );
        assert_eq!(
            eval("status == 'ACTIVE' and not (totalInventory > 0)", &record).unwrap(),
            json!(true)
        );
        assert_eq!(eval("missing || 'x'", &record).unwrap(), json!(true));
        assert_eq!(eval("'10' == 10", &record).unwrap(), json!(true));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let record = json!({ "b": 0 });
        assert_eq!(eval("false && 1 / b", &record).unwrap(), json!(false));
    }

    #[test]
    fn test_scope_resolution_order() {
        let record = json!({ "price": 5, "nested": { "sku": "TEA-6pk" } });
        let mut aliases = BTreeMap::new();
        aliases.insert("price".to_string(), json!(100));
        let primary = json!(7);
        let scope = Scope::new(&record)
            .with_value(&primary)
            .with_aliases(&aliases);

        let expr = Expression::compile("price + value + parseSkuUnits(nested.sku)").unwrap();
        assert_eq!(expr.evaluate(&scope).unwrap(), json!(113));
    }

    #[test]
    fn test_length_limit() {
        let formula = "1+".repeat(250) + "1";
        assert!(matches!(
            Expression::compile(&formula),
            Err(ExpressionError::TooLong { .. })
        ));
        let ok = "1+".repeat(249) + "1";
        assert!(Expression::compile(&ok).is_ok());
    }

    #[test]
    fn test_identifiers() {
        let expr = Expression::compile("ifNull(vendor, title) + value").unwrap();
        assert_eq!(expr.identifiers(), vec!["vendor", "title", "value"]);
        assert_eq!(expr.source(), "ifNull(vendor, title) + value");
    }
}
