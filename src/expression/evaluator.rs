// ABOUTME: Sandboxed interpreter for {{ }} expressions over a DataContext
// ABOUTME: Provides typed evaluation, template rendering, condition and collection coercion

use std::cmp::Ordering;

use serde_json::Value;
use tracing::trace;

use super::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::context::DataContext;
use super::error::{EvaluationError, Result};
use super::functions::{
    as_number, call_date, call_global, call_math, call_method, loose_eq, math_constant,
    stringify, truthy, type_name, GLOBAL_FUNCTIONS,
};
use super::parser::{number_value, parse};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    /// Body of a `{{ }}` region and its byte offset in the template
    Expr(&'a str, usize),
}

/// Split a template into literal text and expression bodies
fn segments(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut out = Vec::new();
    let mut rest = 0;

    while let Some(found) = template[rest..].find(OPEN) {
        let open = rest + found;
        if open > rest {
            out.push(Segment::Text(&template[rest..open]));
        }
        let body_start = open + OPEN.len();
        let close = find_close(&template[body_start..])
            .ok_or(EvaluationError::UnterminatedTemplate { position: open })?;
        out.push(Segment::Expr(
            &template[body_start..body_start + close],
            body_start,
        ));
        rest = body_start + close + CLOSE.len();
    }

    if rest < template.len() {
        out.push(Segment::Text(&template[rest..]));
    }
    Ok(out)
}

/// Find the closing `}}`, ignoring any that appear inside string literals
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => {
                i += 2;
                continue;
            }
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if body[i..].starts_with(CLOSE) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn parse_at(body: &str, offset: usize) -> Result<Expr> {
    parse(body).map_err(|err| match err {
        EvaluationError::Syntax { position, message } => EvaluationError::Syntax {
            position: position + offset,
            message,
        },
        other => other,
    })
}

/// Evaluate an expression string.
///
/// A string that is exactly one `{{ }}` region yields the typed value, text
/// with embedded regions yields the rendered string and text without any
/// region is returned unchanged as a string.
pub fn evaluate(expr: &str, ctx: &DataContext) -> Result<Value> {
    let parts = segments(expr)?;
    let mut bodies = parts.iter().filter_map(|s| match s {
        Segment::Expr(body, offset) => Some((*body, *offset)),
        Segment::Text(_) => None,
    });

    let first = match bodies.next() {
        Some(first) => first,
        None => return Ok(Value::String(expr.to_string())),
    };
    let only_region = bodies.next().is_none()
        && parts.iter().all(|s| match s {
            Segment::Text(text) => text.trim().is_empty(),
            Segment::Expr(..) => true,
        });

    if only_region {
        let (body, offset) = first;
        let ast = parse_at(body, offset)?;
        trace!("Evaluating expression: {}", body.trim());
        Interpreter { ctx }.eval(&ast)
    } else {
        render(&parts, ctx).map(Value::String)
    }
}

/// Substitute every `{{ }}` region of a larger string with its text form
pub fn evaluate_template(template: &str, ctx: &DataContext) -> Result<String> {
    let parts = segments(template)?;
    render(&parts, ctx)
}

fn render(parts: &[Segment<'_>], ctx: &DataContext) -> Result<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            Segment::Text(text) => out.push_str(text),
            Segment::Expr(body, offset) => {
                let ast = parse_at(body, *offset)?;
                let value = Interpreter { ctx }.eval(&ast)?;
                out.push_str(&stringify(&value));
            }
        }
    }
    Ok(out)
}

/// Conditions and collections may be written with or without braces
fn evaluate_bare(expr: &str, ctx: &DataContext) -> Result<Value> {
    if expr.contains(OPEN) {
        evaluate(expr, ctx)
    } else {
        let ast = parse(expr)?;
        Interpreter { ctx }.eval(&ast)
    }
}

/// Evaluate and coerce to a boolean; arrays and objects are rejected
pub fn evaluate_condition(expr: &str, ctx: &DataContext) -> Result<bool> {
    let value = evaluate_bare(expr, ctx)?;
    match value {
        Value::Array(_) | Value::Object(_) => Err(EvaluationError::NonBooleanCondition(
            type_name(&value).to_string(),
        )),
        scalar => Ok(truthy(&scalar)),
    }
}

/// Evaluate an expression that must produce an array of items
pub fn evaluate_collection(expr: &str, ctx: &DataContext) -> Result<Vec<Value>> {
    match evaluate_bare(expr, ctx)? {
        Value::Array(items) => Ok(items),
        other => Err(EvaluationError::NotIterable(type_name(&other).to_string())),
    }
}

/// Parse every region of a template without evaluating it
pub fn check_syntax(template: &str) -> Result<()> {
    let parts = segments(template)?;
    for part in parts {
        if let Segment::Expr(body, offset) = part {
            parse_at(body, offset)?;
        }
    }
    Ok(())
}

/// Syntax check for condition/collection fields, which allow bare expressions
pub fn check_bare_syntax(expr: &str) -> Result<()> {
    if expr.contains(OPEN) {
        check_syntax(expr)
    } else {
        parse(expr).map(|_| ())
    }
}

struct Interpreter<'a> {
    ctx: &'a DataContext,
}

impl Interpreter<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Root(name) => self
                .ctx
                .root(name)
                .ok_or_else(|| EvaluationError::UnknownIdentifier(format!("${}", name))),
            Expr::Name(name) => Err(EvaluationError::UnknownIdentifier(name.clone())),
            Expr::Member { object, property } => match object.as_ref() {
                Expr::Name(ns) if ns == "Math" => math_constant(property),
                Expr::Name(ns) => Err(EvaluationError::UnknownIdentifier(format!(
                    "{}.{}",
                    ns, property
                ))),
                _ => {
                    let target = self.eval(object)?;
                    member(&target, property, expr)
                }
            },
            Expr::Index { object, index } => {
                let target = self.eval(object)?;
                let key = self.eval(index)?;
                index_value(&target, &key, expr)
            }
            Expr::Call { callee, args } => self.call(callee, args),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Negate => number_value(-as_number(&value, "unary '-'")?),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match (op, truthy(&left)) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if truthy(&self.eval(test)?) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    fn args(&self, args: &[Expr]) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    fn call(&self, callee: &Expr, args: &[Expr]) -> Result<Value> {
        match callee {
            Expr::Name(name) => {
                if !GLOBAL_FUNCTIONS.contains(&name.as_str()) {
                    return Err(EvaluationError::UnknownFunction(name.clone()));
                }
                call_global(name, &self.args(args)?)
            }
            Expr::Member { object, property } => match object.as_ref() {
                Expr::Name(ns) if ns == "Math" => call_math(property, &self.args(args)?),
                Expr::Name(ns) if ns == "Date" => {
                    call_date(property, &self.args(args)?, self.ctx.now)
                }
                Expr::Name(ns) => Err(EvaluationError::UnknownFunction(format!(
                    "{}.{}",
                    ns, property
                ))),
                _ => {
                    let target = self.eval(object)?;
                    call_method(&target, property, &self.args(args)?)
                }
            },
            other => Err(EvaluationError::type_error(format!(
                "{} is not callable",
                other.path()
            ))),
        }
    }
}

fn member(target: &Value, property: &str, expr: &Expr) -> Result<Value> {
    match (target, property) {
        (Value::Object(map), _) => map
            .get(property)
            .cloned()
            .ok_or_else(|| EvaluationError::UndefinedPath(expr.path())),
        (Value::Array(items), "length") => Ok(Value::from(items.len())),
        (Value::String(s), "length") => Ok(Value::from(s.chars().count())),
        _ => Err(EvaluationError::UndefinedPath(expr.path())),
    }
}

fn index_value(target: &Value, key: &Value, expr: &Expr) -> Result<Value> {
    let position = |len: usize| -> Option<usize> {
        let n = key.as_f64()?;
        (n >= 0.0 && n.fract() == 0.0 && (n as usize) < len).then_some(n as usize)
    };

    match (target, key) {
        (Value::Array(items), Value::Number(_)) => position(items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| EvaluationError::UndefinedPath(expr.path())),
        (Value::String(s), Value::Number(_)) => {
            let chars: Vec<char> = s.chars().collect();
            position(chars.len())
                .map(|i| Value::String(chars[i].to_string()))
                .ok_or_else(|| EvaluationError::UndefinedPath(expr.path()))
        }
        (_, Value::String(property)) => member(target, property, expr),
        (Value::Null, _) => Err(EvaluationError::UndefinedPath(expr.path())),
        _ => Err(EvaluationError::type_error(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(key)
        ))),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        EvaluationError::type_error(format!(
            "cannot compare {} {} {}",
            type_name(left),
            op.symbol(),
            type_name(right)
        ))
    })
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    let numbers = || -> Result<(f64, f64)> {
        let what = format!("operator '{}'", op.symbol());
        Ok((as_number(left, &what)?, as_number(right, &what)?))
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(op, left, right)? == Ordering::Less)),
        BinaryOp::LtEq => Ok(Value::Bool(compare(op, left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(op, left, right)? == Ordering::Greater)),
        BinaryOp::GtEq => Ok(Value::Bool(compare(op, left, right)? != Ordering::Less)),
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                stringify(left),
                stringify(right)
            ))),
            _ => {
                let (a, b) = numbers()?;
                number_value(a + b)
            }
        },
        BinaryOp::Sub => numbers().and_then(|(a, b)| number_value(a - b)),
        BinaryOp::Mul => numbers().and_then(|(a, b)| number_value(a * b)),
        BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numbers()?;
            if b == 0.0 {
                return Err(EvaluationError::DivisionByZero);
            }
            number_value(if op == BinaryOp::Div { a / b } else { a % b })
        }
    }
}
