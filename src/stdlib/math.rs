use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::Function;
use crate::value::Value;

use super::{float_arg, function, int_arg, string_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("math.floor", 1, 1, floor),
        function("math.ceil", 1, 1, ceil),
        function("math.round", 1, 1, round),
        function("math.trunc", 1, 1, trunc),
        function("math.sqrt", 1, 1, sqrt),
        function("math.exp", 1, 1, exp),
        function("math.log", 1, 1, ln),
        function("math.log2", 1, 1, log2),
        function("math.log10", 1, 1, log10),
        function("math.is_nan", 1, 1, is_nan),
        function("math.is_infinite", 1, 1, is_infinite),
        function("math.is_finite", 1, 1, is_finite),
        function("randomint", 2, 2, randomint),
        function("randombool", 2, 2, randombool),
        function("randomstr", 1, 2, randomstr),
    ]
}

fn unary(args: &[Value], f: fn(f64) -> f64) -> Result<Value, EvalError> {
    Ok(Value::Float(f(float_arg(args, 0, f64::NAN))))
}

fn floor(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::floor)
}

fn ceil(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::ceil)
}

fn round(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::round)
}

fn trunc(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::trunc)
}

fn sqrt(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::sqrt)
}

fn exp(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::exp)
}

fn ln(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::ln)
}

fn log2(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::log2)
}

fn log10(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    unary(args, f64::log10)
}

fn is_nan(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(float_arg(args, 0, f64::NAN).is_nan()))
}

fn is_infinite(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(float_arg(args, 0, 0.0).is_infinite()))
}

fn is_finite(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(float_arg(args, 0, f64::NAN).is_finite()))
}

/// Inclusive on both ends; reversed bounds are swapped.
fn randomint(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let a = int_arg(args, 0, 0);
    let b = int_arg(args, 1, 0);
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    Ok(Value::Integer(fastrand::i64(low..=high)))
}

/// True with probability `numerator / denominator`.
fn randombool(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let numerator = int_arg(args, 0, 0);
    let denominator = int_arg(args, 1, 0);
    if denominator <= 0 || numerator <= 0 {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(fastrand::i64(0..denominator) < numerator))
}

const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

fn randomstr(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let length = int_arg(args, 0, 0).clamp(0, 4096) as usize;
    let charset: Vec<char> = match args.get(1) {
        Some(_) => string_arg(args, 1).chars().collect(),
        None => DEFAULT_CHARSET.chars().collect(),
    };
    if charset.is_empty() {
        return Ok(Value::str(""));
    }
    let out: String = (0..length)
        .map(|_| charset[fastrand::usize(..charset.len())])
        .collect();
    Ok(Value::str(out))
}
