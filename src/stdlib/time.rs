use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::Function;
use crate::value::{duration_secs, parse_duration, time_from_secs, Value};

use super::{function, int_arg, string_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("strftime", 2, 2, strftime),
        function("time.add", 2, 2, add),
        function("time.sub", 2, 2, sub),
        function("time.is_after", 2, 2, is_after),
        function("std.time", 2, 2, time),
        function("std.integer2time", 1, 1, integer2time),
        function("parse_time_delta", 1, 1, parse_time_delta),
    ]
}

fn time_arg(ctx: &Context, args: &[Value], index: usize) -> DateTime<Utc> {
    args.get(index).and_then(Value::to_time).unwrap_or(ctx.now)
}

fn shifted(t: DateTime<Utc>, secs: f64) -> Value {
    match time_from_secs(t.timestamp_millis() as f64 / 1000.0 + secs) {
        Some(t) => Value::Time(t),
        None => Value::Time(t),
    }
}

/// An unsupported format specifier yields "".
fn strftime(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let format = string_arg(args, 0);
    let t = time_arg(ctx, args, 1);
    let mut out = String::new();
    match write!(out, "{}", t.format(&format)) {
        Ok(()) => Ok(Value::str(out)),
        Err(_) => Ok(Value::str("")),
    }
}

fn add(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let t = time_arg(ctx, args, 0);
    let delta = args.get(1).map(duration_secs).unwrap_or(0);
    Ok(shifted(t, delta as f64))
}

fn sub(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let t = time_arg(ctx, args, 0);
    let delta = args.get(1).map(duration_secs).unwrap_or(0);
    Ok(shifted(t, -(delta as f64)))
}

fn is_after(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(time_arg(ctx, args, 0) > time_arg(ctx, args, 1)))
}

/// Parses a date string, or returns the fallback time.
fn time(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    match args.get(0).and_then(Value::to_time) {
        Some(t) => Ok(Value::Time(t)),
        None => Ok(Value::Time(time_arg(ctx, args, 1))),
    }
}

fn integer2time(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let secs = int_arg(args, 0, ctx.now.timestamp());
    Ok(match time_from_secs(secs as f64) {
        Some(t) => Value::Time(t),
        None => Value::Time(ctx.now),
    })
}

fn parse_time_delta(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Integer(
        parse_duration(&string_arg(args, 0))
            .map(|secs| secs as i64)
            .unwrap_or(0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::tests::{call, ctx};
    use chrono::TimeZone;

    #[test]
    fn test_strftime() {
        let mut ctx = ctx();
        let t = Utc.timestamp_opt(86_400, 0).single().unwrap();
        assert_eq!(
            call(&mut ctx, "strftime", &[Value::str("%Y-%m-%d"), Value::Time(t)]),
            Value::str("1970-01-02")
        );
    }

    #[test]
    fn test_arithmetic() {
        let mut ctx = ctx();
        let t = Utc.timestamp_opt(0, 0).single().unwrap();
        let later = call(&mut ctx, "time.add", &[Value::Time(t), Value::str("1h")]);
        assert_eq!(later.to_time().unwrap().timestamp(), 3600);
        let earlier = call(&mut ctx, "time.sub", &[later.clone(), Value::Integer(600)]);
        assert_eq!(earlier.to_time().unwrap().timestamp(), 3000);
        assert_eq!(
            call(&mut ctx, "time.is_after", &[later, earlier]),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_parsing() {
        let mut ctx = ctx();
        let fallback = Utc.timestamp_opt(5, 0).single().unwrap();
        let parsed = call(
            &mut ctx,
            "std.time",
            &[Value::str("Thu, 01 Jan 1970 00:01:00 GMT"), Value::Time(fallback)],
        );
        assert_eq!(parsed.to_time().unwrap().timestamp(), 60);
        let bad = call(&mut ctx, "std.time", &[Value::str("garbage"), Value::Time(fallback)]);
        assert_eq!(bad, Value::Time(fallback));
        assert_eq!(
            call(&mut ctx, "parse_time_delta", &[Value::str("2d")]),
            Value::Integer(172_800)
        );
        assert_eq!(
            call(&mut ctx, "std.integer2time", &[Value::Integer(60)]),
            Value::Time(Utc.timestamp_opt(60, 0).single().unwrap())
        );
    }
}
