//! Transformation functions applicable in a token pipeline.
//!
//! Each function validates its argument arity before executing and fails
//! with [`ResolveError::FunctionArgument`] on mismatch.

use serde_json::Value;

use super::parser::FunctionCall;
use super::ResolveError;

/// Apply one pipeline step to a resolved value.
pub fn apply(call: &FunctionCall, value: Value) -> Result<Value, ResolveError> {
    match call.name.as_str() {
        // String family
        "upper" => {
            expect_args(call, 0, 0)?;
            Ok(Value::String(as_str(call, &value)?.to_uppercase()))
        }
        "lower" => {
            expect_args(call, 0, 0)?;
            Ok(Value::String(as_str(call, &value)?.to_lowercase()))
        }
        "trim" => {
            expect_args(call, 0, 0)?;
            Ok(Value::String(as_str(call, &value)?.trim().to_string()))
        }
        "substring" => {
            expect_args(call, 1, 2)?;
            let s = as_str(call, &value)?;
            let start = arg_usize(call, 0)?;
            let chars: Vec<char> = s.chars().collect();
            let start = start.min(chars.len());
            let end = match call.args.get(1) {
                Some(_) => (start + arg_usize(call, 1)?).min(chars.len()),
                None => chars.len(),
            };
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        "replace" => {
            expect_args(call, 2, 2)?;
            let s = as_str(call, &value)?;
            let from = arg_str(call, 0)?;
            let to = arg_str(call, 1)?;
            Ok(Value::String(s.replace(&from, &to)))
        }
        "length" => {
            expect_args(call, 0, 0)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(type_error(call, format!("cannot take length of {}", kind(other))))
                }
            };
            Ok(Value::from(len as u64))
        }
        // Math family
        "add" => numeric_op(call, value, |a, b| a + b),
        "sub" => numeric_op(call, value, |a, b| a - b),
        "mul" => numeric_op(call, value, |a, b| a * b),
        "div" => {
            expect_args(call, 1, 1)?;
            let a = as_f64(call, &value)?;
            let b = arg_f64(call, 0)?;
            if b == 0.0 {
                return Err(type_error(call, "division by zero".to_string()));
            }
            number(call, a / b)
        }
        "round" => {
            expect_args(call, 0, 1)?;
            let v = as_f64(call, &value)?;
            match call.args.first() {
                None => Ok(Value::from(v.round() as i64)),
                Some(_) => {
                    let digits = arg_usize(call, 0)? as i32;
                    let factor = 10f64.powi(digits);
                    number(call, (v * factor).round() / factor)
                }
            }
        }
        other => Err(ResolveError::UnknownFunction(other.to_string())),
    }
}

fn expect_args(call: &FunctionCall, min: usize, max: usize) -> Result<(), ResolveError> {
    let got = call.args.len();
    if got < min || got > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ResolveError::FunctionArgument {
            function: call.name.clone(),
            expected,
            got,
        });
    }
    Ok(())
}

fn numeric_op(
    call: &FunctionCall,
    value: Value,
    op: fn(f64, f64) -> f64,
) -> Result<Value, ResolveError> {
    expect_args(call, 1, 1)?;
    // Integer operands stay integers so downstream comparisons don't see
    // spurious fractional values.
    if let (Some(a), Some(Value::Number(arg))) = (value.as_i64(), call.args.first()) {
        if let Some(b) = arg.as_i64() {
            let result = op(a as f64, b as f64);
            return Ok(Value::from(result as i64));
        }
    }
    let a = as_f64(call, &value)?;
    let b = arg_f64(call, 0)?;
    number(call, op(a, b))
}

fn number(call: &FunctionCall, v: f64) -> Result<Value, ResolveError> {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| type_error(call, format!("non-finite result: {}", v)))
}

fn as_str<'a>(call: &FunctionCall, value: &'a Value) -> Result<&'a str, ResolveError> {
    value
        .as_str()
        .ok_or_else(|| type_error(call, format!("expected string, got {}", kind(value))))
}

fn as_f64(call: &FunctionCall, value: &Value) -> Result<f64, ResolveError> {
    value
        .as_f64()
        .ok_or_else(|| type_error(call, format!("expected number, got {}", kind(value))))
}

fn arg_str(call: &FunctionCall, index: usize) -> Result<String, ResolveError> {
    match call.args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(stringify(other)),
        None => Err(type_error(call, format!("missing argument {}", index))),
    }
}

fn arg_f64(call: &FunctionCall, index: usize) -> Result<f64, ResolveError> {
    call.args
        .get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| type_error(call, format!("argument {} must be a number", index)))
}

fn arg_usize(call: &FunctionCall, index: usize) -> Result<usize, ResolveError> {
    call.args
        .get(index)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| type_error(call, format!("argument {} must be a non-negative integer", index)))
}

fn type_error(call: &FunctionCall, detail: String) -> ResolveError {
    ResolveError::Type {
        function: call.name.clone(),
        detail,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(super) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
