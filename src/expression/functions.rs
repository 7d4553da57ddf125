// ABOUTME: Whitelisted pure functions and value methods available to expressions
// ABOUTME: Covers global helpers, Math.*, Date.* and string/array/number methods

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use std::fmt::Write;

use super::error::{EvaluationError, Result};
use super::parser::number_value;

pub const GLOBAL_FUNCTIONS: &[&str] = &[
    "len", "str", "int", "float", "bool", "sum", "min", "max", "abs", "round",
];

const MAX_FIXED_DIGITS: f64 = 100.0;

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// JavaScript-style truthiness used by `!`, `&&`, `||` and `?:`
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used for template substitution and string concatenation
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn as_number(value: &Value, what: &str) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        EvaluationError::type_error(format!(
            "{} expects a number, got {}",
            what,
            type_name(value)
        ))
    })
}

fn as_str<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        EvaluationError::type_error(format!(
            "{} expects a string, got {}",
            what,
            type_name(value)
        ))
    })
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(EvaluationError::invalid_args(
            name,
            format!("expected {} argument(s), got {}", expected, args.len()),
        ));
    }
    Ok(())
}

/// Numbers from either a single array argument or a variadic list
fn numeric_operands(name: &str, args: &[Value]) -> Result<Vec<f64>> {
    let items: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    if items.is_empty() {
        return Err(EvaluationError::invalid_args(name, "no values given"));
    }
    items.iter().map(|v| as_number(v, name)).collect()
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

pub fn call_global(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "len" => {
            arity(name, args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(EvaluationError::type_error(format!(
                        "len() is not defined for {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(len))
        }
        "str" => {
            arity(name, args, 1, 1)?;
            Ok(Value::String(stringify(&args[0])))
        }
        "int" => {
            arity(name, args, 1, 1)?;
            let parsed = match &args[0] {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    EvaluationError::invalid_args(name, format!("'{}' is not a number", s))
                })?,
                other => {
                    return Err(EvaluationError::type_error(format!(
                        "int() is not defined for {}",
                        type_name(other)
                    )))
                }
            };
            number_value(parsed.trunc())
        }
        "float" => {
            arity(name, args, 1, 1)?;
            let parsed = match &args[0] {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    EvaluationError::invalid_args(name, format!("'{}' is not a number", s))
                })?,
                other => {
                    return Err(EvaluationError::type_error(format!(
                        "float() is not defined for {}",
                        type_name(other)
                    )))
                }
            };
            number_value(parsed)
        }
        "bool" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "sum" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Array(items) => {
                    let mut total = 0.0;
                    for item in items {
                        total += as_number(item, name)?;
                    }
                    number_value(total)
                }
                other => Err(EvaluationError::type_error(format!(
                    "sum() expects an array, got {}",
                    type_name(other)
                ))),
            }
        }
        "min" => {
            let values = numeric_operands(name, args)?;
            number_value(values.into_iter().fold(f64::INFINITY, f64::min))
        }
        "max" => {
            let values = numeric_operands(name, args)?;
            number_value(
                values.into_iter().fold(f64::NEG_INFINITY, f64::max),
            )
        }
        "abs" => {
            arity(name, args, 1, 1)?;
            number_value(as_number(&args[0], name)?.abs())
        }
        "round" => {
            arity(name, args, 1, 2)?;
            let value = as_number(&args[0], name)?;
            let digits = match args.get(1) {
                Some(d) => as_number(d, name)? as i32,
                None => 0,
            };
            number_value(round_to(value, digits))
        }
        _ => Err(EvaluationError::UnknownFunction(name.to_string())),
    }
}

pub fn math_constant(name: &str) -> Result<Value> {
    match name {
        "PI" => number_value(std::f64::consts::PI),
        "E" => number_value(std::f64::consts::E),
        _ => Err(EvaluationError::UnknownIdentifier(format!("Math.{}", name))),
    }
}

pub fn call_math(name: &str, args: &[Value]) -> Result<Value> {
    let qualified = format!("Math.{}", name);
    let unary = |f: fn(f64) -> f64| -> Result<Value> {
        arity(&qualified, args, 1, 1)?;
        number_value(f(as_number(&args[0], &qualified)?))
    };

    match name {
        "abs" => unary(f64::abs),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "round" => unary(f64::round),
        "sqrt" => {
            arity(&qualified, args, 1, 1)?;
            let value = as_number(&args[0], &qualified)?;
            if value < 0.0 {
                return Err(EvaluationError::invalid_args(
                    &qualified,
                    "square root of a negative number",
                ));
            }
            number_value(value.sqrt())
        }
        "pow" => {
            arity(&qualified, args, 2, 2)?;
            let base = as_number(&args[0], &qualified)?;
            let exp = as_number(&args[1], &qualified)?;
            number_value(base.powf(exp))
        }
        "min" => {
            let values = numeric_operands(&qualified, args)?;
            number_value(values.into_iter().fold(f64::INFINITY, f64::min))
        }
        "max" => {
            let values = numeric_operands(&qualified, args)?;
            number_value(
                values.into_iter().fold(f64::NEG_INFINITY, f64::max),
            )
        }
        _ => Err(EvaluationError::UnknownFunction(qualified)),
    }
}

fn parse_date(value: &Value, what: &str) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_f64().unwrap_or(0.0) as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| EvaluationError::invalid_args(what, "timestamp out of range"))
        }
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .ok_or_else(|| {
                    EvaluationError::invalid_args(what, format!("'{}' is not a valid date", s))
                })
        }
        other => Err(EvaluationError::type_error(format!(
            "{} expects a date string or timestamp, got {}",
            what,
            type_name(other)
        ))),
    }
}

pub fn call_date(name: &str, args: &[Value], now: DateTime<Utc>) -> Result<Value> {
    let qualified = format!("Date.{}", name);
    match name {
        "now" => {
            arity(&qualified, args, 0, 0)?;
            Ok(Value::from(now.timestamp_millis()))
        }
        "parse" => {
            arity(&qualified, args, 1, 1)?;
            Ok(Value::from(
                parse_date(&args[0], &qualified)?.timestamp_millis(),
            ))
        }
        "format" => {
            arity(&qualified, args, 1, 2)?;
            let date = parse_date(&args[0], &qualified)?;
            let format = match args.get(1) {
                Some(f) => as_str(f, &qualified)?.to_string(),
                None => "%Y-%m-%d %H:%M:%S".to_string(),
            };
            let items = StrftimeItems::new(&format);
            let invalid = || {
                EvaluationError::invalid_args(
                    &qualified,
                    format!("'{}' is not a valid date format", format),
                )
            };
            if items.clone().any(|item| matches!(item, Item::Error)) {
                return Err(invalid());
            }
            let mut rendered = String::new();
            write!(rendered, "{}", date.format_with_items(items)).map_err(|_| invalid())?;
            Ok(Value::String(rendered))
        }
        _ => Err(EvaluationError::UnknownFunction(qualified)),
    }
}

pub fn call_method(target: &Value, method: &str, args: &[Value]) -> Result<Value> {
    let unknown = || EvaluationError::UnknownMethod {
        method: method.to_string(),
        target: type_name(target).to_string(),
    };

    match target {
        Value::String(s) => string_method(s, method, args).unwrap_or_else(|| Err(unknown())),
        Value::Array(items) => array_method(items, method, args).unwrap_or_else(|| Err(unknown())),
        Value::Number(n) => match method {
            "toFixed" => {
                arity(method, args, 0, 1)?;
                let digits = match args.first() {
                    Some(d) => as_number(d, method)?,
                    None => 0.0,
                };
                if !(0.0..=MAX_FIXED_DIGITS).contains(&digits) {
                    return Err(EvaluationError::invalid_args(
                        method,
                        format!("digits must be between 0 and {}", MAX_FIXED_DIGITS),
                    ));
                }
                let digits = digits as usize;
                Ok(Value::String(format!(
                    "{:.*}",
                    digits,
                    n.as_f64().unwrap_or(0.0)
                )))
            }
            "toString" => Ok(Value::String(n.to_string())),
            _ => Err(unknown()),
        },
        _ => Err(unknown()),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Option<Result<Value>> {
    let result = match method {
        "toUpperCase" => arity(method, args, 0, 0).map(|_| Value::String(s.to_uppercase())),
        "toLowerCase" => arity(method, args, 0, 0).map(|_| Value::String(s.to_lowercase())),
        "trim" => arity(method, args, 0, 0).map(|_| Value::String(s.trim().to_string())),
        "toString" => Ok(Value::String(s.to_string())),
        "split" => arity(method, args, 0, 1).and_then(|_| {
            let parts: Vec<Value> = match args.first() {
                None => vec![Value::String(s.to_string())],
                Some(sep) => {
                    let sep = as_str(sep, method)?;
                    if sep.is_empty() {
                        s.chars().map(|c| Value::String(c.to_string())).collect()
                    } else {
                        s.split(sep).map(|p| Value::String(p.to_string())).collect()
                    }
                }
            };
            Ok(Value::Array(parts))
        }),
        "includes" => arity(method, args, 1, 1)
            .and_then(|_| as_str(&args[0], method))
            .map(|needle| Value::Bool(s.contains(needle))),
        "startsWith" => arity(method, args, 1, 1)
            .and_then(|_| as_str(&args[0], method))
            .map(|prefix| Value::Bool(s.starts_with(prefix))),
        "endsWith" => arity(method, args, 1, 1)
            .and_then(|_| as_str(&args[0], method))
            .map(|suffix| Value::Bool(s.ends_with(suffix))),
        "replace" => arity(method, args, 2, 2).and_then(|_| {
            let from = as_str(&args[0], method)?;
            let to = as_str(&args[1], method)?;
            Ok(Value::String(s.replacen(from, to, 1)))
        }),
        "substring" => arity(method, args, 1, 2).and_then(|_| {
            let chars: Vec<char> = s.chars().collect();
            let clamp = |v: f64| (v.max(0.0) as usize).min(chars.len());
            let start = clamp(as_number(&args[0], method)?);
            let end = match args.get(1) {
                Some(e) => clamp(as_number(e, method)?),
                None => chars.len(),
            };
            let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
            Ok(Value::String(chars[lo..hi].iter().collect()))
        }),
        _ => return None,
    };
    Some(result)
}

fn array_method(items: &[Value], method: &str, args: &[Value]) -> Option<Result<Value>> {
    let result = match method {
        "join" => arity(method, args, 0, 1).and_then(|_| {
            let sep = match args.first() {
                Some(sep) => as_str(sep, method)?.to_string(),
                None => ",".to_string(),
            };
            Ok(Value::String(
                items.iter().map(stringify).collect::<Vec<_>>().join(&sep),
            ))
        }),
        "includes" => arity(method, args, 1, 1)
            .map(|_| Value::Bool(items.iter().any(|item| loose_eq(item, &args[0])))),
        _ => return None,
    };
    Some(result)
}

/// Equality that treats `1` and `1.0` as the same number
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}
