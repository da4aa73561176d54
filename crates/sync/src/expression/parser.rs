//! Pratt parser producing the formula AST.

use serde_json::Value;

use super::ExpressionError;
use super::functions::Function;
use super::lexer::{Spanned, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Collect identifiers referenced anywhere in the tree.
    pub fn identifiers(&self, out: &mut Vec<String>) {
        match self {
            Self::Literal(_) => {}
            Self::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Self::Unary { expr, .. } => expr.identifiers(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.identifiers(out);
                rhs.identifiers(out);
            }
            Self::Ternary {
                condition,
                then,
                otherwise,
            } => {
                condition.identifiers(out);
                then.identifiers(out);
                otherwise.identifiers(out);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.identifiers(out);
                }
            }
        }
    }
}

const TERNARY_BP: u8 = 1;
const PREFIX_BP: u8 = 8;

const fn infix_binding(token: &Token) -> Option<(BinaryOp, u8)> {
    Some(match token {
        Token::Or => (BinaryOp::Or, 2),
        Token::And => (BinaryOp::And, 3),
        Token::EqEq => (BinaryOp::Eq, 4),
        Token::NotEq => (BinaryOp::NotEq, 4),
        Token::Lt => (BinaryOp::Lt, 5),
        Token::LtEq => (BinaryOp::LtEq, 5),
        Token::Gt => (BinaryOp::Gt, 5),
        Token::GtEq => (BinaryOp::GtEq, 5),
        Token::Plus => (BinaryOp::Add, 6),
        Token::Minus => (BinaryOp::Sub, 6),
        Token::Star => (BinaryOp::Mul, 7),
        Token::Slash => (BinaryOp::Div, 7),
        Token::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    })
}

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub const fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse a complete formula.
    pub fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.expression(0)?;
        match self.peek() {
            Token::Eof => Ok(expr),
            other => Err(self.error(format!("unexpected {other:?}"))),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |s| s.position)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {expected:?}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position(),
            message,
        }
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.prefix()?;

        loop {
            if *self.peek() == Token::Question {
                if TERNARY_BP < min_bp {
                    break;
                }
                self.advance();
                let then = self.expression(0)?;
                self.expect(&Token::Colon)?;
                let otherwise = self.expression(TERNARY_BP)?;
                lhs = Expr::Ternary {
                    condition: Box::new(lhs),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                };
                continue;
            }

            let Some((op, bp)) = infix_binding(self.peek()) else {
                break;
            };
            if bp <= min_bp {
                break;
            }
            self.advance();
            let rhs = self.expression(bp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Minus => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.expression(PREFIX_BP)?),
            }),
            Token::Not => Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.expression(PREFIX_BP)?),
            }),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if *self.peek() == Token::LParen => {
                self.advance();
                let args = self.arguments()?;
                let function = Function::lookup(&name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                function.check_arity(args.len())?;
                Ok(Expr::Call { function, args })
            }
            Token::Ident(name) => Ok(Expr::Ident(name)),
            other => Err(ExpressionError::Syntax {
                position,
                message: format!("unexpected {other:?}"),
            }),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expression(0)?);
            match self.advance() {
                Token::Comma => {}
                Token::RParen => return Ok(args),
                other => return Err(self.error(format!("expected ',' or ')', found {other:?}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse(source: &str) -> Result<Expr, ExpressionError> {
        Parser::new(tokenize(source)?).parse()
    }

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Literal(serde_json::json!(n)))
    }

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: num(1.0),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: num(2.0),
                    rhs: num(3.0),
                }),
            }
        );
    }

    #[test]
    fn test_left_associative_subtraction() {
        let expr = parse("5 - 2 - 1").unwrap();
        let Expr::Binary { lhs, .. } = expr else {
            panic!("expected binary");
        };
        assert!(matches!(*lhs, Expr::Binary { op: BinaryOp::Sub, .. }));
    }

    #[test]
    fn test_nested_ternary_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").unwrap();
        let Expr::Ternary { otherwise, .. } = expr else {
            panic!("expected ternary");
        };
        assert!(matches!(*otherwise, Expr::Ternary { .. }));
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        assert_eq!(
            parse("eval('x')").unwrap_err(),
            ExpressionError::UnknownFunction("eval".into())
        );
    }

    #[test]
    fn test_arity_is_checked() {
        assert!(matches!(
            parse("substring()").unwrap_err(),
            ExpressionError::Arity { .. }
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("1 +").is_err());
        assert!(parse("(1 + 2").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("f(1,").is_err());
    }

    #[test]
    fn test_identifiers_are_collected_once() {
        let expr = parse("price * qty + price").unwrap();
        let mut ids = Vec::new();
        expr.identifiers(&mut ids);
        assert_eq!(ids, vec!["price".to_string(), "qty".to_string()]);
    }
}
