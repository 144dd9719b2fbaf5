use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::Function;
use crate::value::{Value, VclString};

use super::{function, string_arg, variadic, vcl_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("header.get", 2, 2, get),
        function("header.set", 3, 3, set),
        function("header.unset", 2, 2, unset),
        variadic("header.filter", 2, filter),
        variadic("header.filter_except", 2, filter_except),
    ]
}

fn get(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let scope = string_arg(args, 0);
    let name = string_arg(args, 1);
    Ok(match ctx.headers(&scope).and_then(|headers| headers.get(&name)) {
        Some(value) => Value::str(value),
        None => Value::not_set(),
    })
}

fn set(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let scope = string_arg(args, 0);
    let name = string_arg(args, 1);
    let value = vcl_arg(args, 2);
    if let Some(headers) = ctx.headers_mut(&scope) {
        match value {
            VclString::NotSet => {
                headers.remove(&name);
            }
            other => headers.set(&name, other.as_str()),
        }
    }
    Ok(Value::not_set())
}

fn unset(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let scope = string_arg(args, 0);
    let name = string_arg(args, 1);
    if let Some(headers) = ctx.headers_mut(&scope) {
        headers.remove(&name);
    }
    Ok(Value::not_set())
}

fn names(args: &[Value]) -> Vec<String> {
    args.iter()
        .skip(1)
        .map(|name| name.to_plain_string().to_ascii_lowercase())
        .collect()
}

/// Removes every listed header.
fn filter(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let scope = string_arg(args, 0);
    let names = names(args);
    if let Some(headers) = ctx.headers_mut(&scope) {
        headers.retain(|name| !names.iter().any(|n| n == name));
    }
    Ok(Value::not_set())
}

/// Removes every header except the listed ones.
fn filter_except(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let scope = string_arg(args, 0);
    let names = names(args);
    if let Some(headers) = ctx.headers_mut(&scope) {
        headers.retain(|name| names.iter().any(|n| n == name));
    }
    Ok(Value::not_set())
}
