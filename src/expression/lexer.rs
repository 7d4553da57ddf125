// ABOUTME: Tokenizer for the workflow expression language
// ABOUTME: Converts the inside of a {{ }} region into a flat token stream

use super::error::{EvaluationError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    /// `$json`, `$node`, ... stored without the leading `$`
    Root(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() {
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                // a second dot ends the literal: `1.2.3` is a member access error later
                if chars[pos] == '.'
                    && (pos + 1 >= chars.len() || !chars[pos + 1].is_ascii_digit())
                {
                    break;
                }
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| EvaluationError::syntax(start, format!("invalid number '{}'", text)))?;
            tokens.push(Spanned {
                token: Token::Number(value),
                position: start,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let (value, next) = read_string(&chars, pos, c)?;
            tokens.push(Spanned {
                token: Token::Str(value),
                position: start,
            });
            pos = next;
            continue;
        }

        if c == '$' || c.is_alphabetic() || c == '_' {
            pos += 1;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            let token = if let Some(root) = word.strip_prefix('$') {
                if root.is_empty() {
                    return Err(EvaluationError::syntax(start, "expected identifier after '$'"));
                }
                Token::Root(root.to_string())
            } else {
                match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(word),
                }
            };
            tokens.push(Spanned {
                token,
                position: start,
            });
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => {
                // `===` is accepted as a synonym for `==`
                if chars.get(pos + 2) == Some(&'=') {
                    (Token::EqEq, 3)
                } else {
                    (Token::EqEq, 2)
                }
            }
            ('!', Some('=')) => {
                if chars.get(pos + 2) == Some(&'=') {
                    (Token::NotEq, 3)
                } else {
                    (Token::NotEq, 2)
                }
            }
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Bang, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('=', _) => {
                return Err(EvaluationError::syntax(
                    start,
                    "assignment is not allowed, use '==' for comparison",
                ))
            }
            _ => {
                return Err(EvaluationError::syntax(
                    start,
                    format!("unexpected character '{}'", c),
                ))
            }
        };
        tokens.push(Spanned {
            token,
            position: start,
        });
        pos += width;
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut value = String::new();
    let mut pos = start + 1;

    while pos < chars.len() {
        match chars[pos] {
            '\\' => {
                let escaped = chars
                    .get(pos + 1)
                    .ok_or_else(|| EvaluationError::syntax(pos, "dangling escape"))?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                pos += 2;
            }
            c if c == quote => return Ok((value, pos + 1)),
            c => {
                value.push(c);
                pos += 1;
            }
        }
    }

    Err(EvaluationError::syntax(start, "unterminated string literal"))
}
