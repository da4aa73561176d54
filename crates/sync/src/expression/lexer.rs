//! Tokenizer for mapping formulas.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    /// Identifier, possibly dotted (`variants.0.price`).
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    Eof,
}

/// A token and the byte offset it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&(position, c)) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|&(_, c)| c);
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('"' | '\'', _) => {
                let (s, consumed) = read_string(&chars, i, c)?;
                (Token::Str(s), consumed)
            }
            (c, _) if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let (n, consumed) = read_number(&chars, i)?;
                (Token::Number(n), consumed)
            }
            (c, _) if is_ident_start(c) => {
                let (ident, consumed) = read_ident(&chars, i);
                let token = match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                };
                (token, consumed)
            }
            (c, _) => {
                return Err(ExpressionError::Syntax {
                    position,
                    message: format!("unexpected character '{c}'"),
                });
            }
        };

        tokens.push(Spanned { token, position });
        i += width;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        position: source.len(),
    });
    Ok(tokens)
}

const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn read_ident(chars: &[(usize, char)], start: usize) -> (String, usize) {
    let mut ident = String::new();
    let mut i = start;
    while let Some(&(_, c)) = chars.get(i) {
        if is_ident_char(c) {
            ident.push(c);
            i += 1;
        } else if c == '.' && chars.get(i + 1).is_some_and(|&(_, n)| is_ident_char(n)) {
            ident.push(c);
            i += 1;
        } else {
            break;
        }
    }
    (ident, i - start)
}

fn read_number(chars: &[(usize, char)], start: usize) -> Result<(f64, usize), ExpressionError> {
    let mut text = String::new();
    let mut i = start;
    let mut seen_dot = false;
    while let Some(&(_, c)) = chars.get(i) {
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            text.push(c);
        } else {
            break;
        }
        i += 1;
    }
    let position = chars.get(start).map_or(0, |&(p, _)| p);
    text.parse::<f64>()
        .map(|n| (n, i - start))
        .map_err(|_| ExpressionError::Syntax {
            position,
            message: format!("invalid number '{text}'"),
        })
}

fn read_string(
    chars: &[(usize, char)],
    start: usize,
    quote: char,
) -> Result<(String, usize), ExpressionError> {
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        let Some(&(_, c)) = chars.get(i) else {
            return Err(ExpressionError::Syntax {
                position: chars.get(start).map_or(0, |&(p, _)| p),
                message: "unterminated string".to_string(),
            });
        };
        i += 1;
        if c == quote {
            return Ok((out, i - start));
        }
        if c == '\\' {
            let Some(&(_, escaped)) = chars.get(i) else {
                continue;
            };
            i += 1;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
        } else {
            out.push(c);
        }
    }
}
