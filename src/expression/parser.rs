// ABOUTME: Recursive-descent parser for workflow expressions
// ABOUTME: Builds the restricted AST from tokens, one function per precedence level

use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::error::{EvaluationError, Result};
use super::lexer::{tokenize, Spanned, Token};

/// Bound on AST depth; keeps parsing, evaluation and drop off the stack limit
const MAX_DEPTH: usize = 128;

/// Parse the body of a single `{{ }}` region
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(EvaluationError::syntax(0, "empty expression"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
        depth: 0,
    };
    let expr = parser.ternary()?;

    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(EvaluationError::syntax(
            extra.position,
            format!("unexpected token {:?}", extra.token),
        ));
    }

    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    /// Upper bound on the depth of the tree built at the current nesting level
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.position)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(EvaluationError::syntax(
                self.position(),
                format!("expected {}", what),
            ))
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvaluationError::syntax(
                self.position(),
                format!("expression nested deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr> {
        let depth = self.depth;
        let result = self.descend().and_then(|_| self.conditional());
        self.depth = depth;
        result
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.logical_or()?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }

        let consequent = self.ternary()?;
        self.expect(Token::Colon, "':' in conditional expression")?;
        let alternate = self.ternary()?;

        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn logical_or(&mut self) -> Result<Expr> {
        let mut left = self.logical_and()?;
        while self.eat(&Token::OrOr) {
            self.descend()?;
            let right = self.logical_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            self.descend()?;
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            self.descend()?;
            let right = self.relational()?;
            left = binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            self.descend()?;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            self.descend()?;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            self.descend()?;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Negate,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.descend()?;
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if matches!(
                self.peek(),
                Some(Token::Dot) | Some(Token::LBracket) | Some(Token::LParen)
            ) {
                self.descend()?;
            }
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let position = self.position();
                    match self.advance() {
                        Some(Token::Ident(property)) => {
                            expr = Expr::Member {
                                object: Box::new(expr),
                                property,
                            }
                        }
                        _ => {
                            return Err(EvaluationError::syntax(
                                position,
                                "expected property name after '.'",
                            ))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.ternary()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::LParen) => {
                    self.pos += 1;
                    let args = self.arguments(Token::RParen, "')'")?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self, close: Token, what: &str) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(close.clone(), what)?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let position = self.position();
        let token = self
            .advance()
            .ok_or_else(|| EvaluationError::syntax(position, "unexpected end of expression"))?;

        match token {
            Token::Number(n) => number_value(n).map(Expr::Literal),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Root(name) => Ok(Expr::Root(name)),
            Token::Ident(name) => Ok(Expr::Name(name)),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.arguments(Token::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            other => Err(EvaluationError::syntax(
                position,
                format!("unexpected token {:?}", other),
            )),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Integral values become JSON integers so `2 + 2` renders as `4`
pub(crate) fn number_value(n: f64) -> Result<Value> {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvaluationError::NonFiniteNumber(n.to_string()))
}
