//! The `std.*` call surface. Functions are looked up by their full dotted
//! name and receive already-evaluated positional arguments.

use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::{self, Action, Function};
use crate::value::{Value, VclString};

pub mod codec;
pub mod digest;
pub mod header;
pub mod math;
pub mod objects;
pub mod querystring;
pub mod string;
pub mod time;

type Callable = fn(&mut Context, &[Value]) -> Result<Value, EvalError>;

pub(crate) fn function(name: &'static str, min: usize, max: usize, callable: Callable) -> Function {
    Function {
        name,
        min_arity: min,
        max_arity: Some(max),
        callable,
    }
}

pub(crate) fn variadic(name: &'static str, min: usize, callable: Callable) -> Function {
    Function {
        name,
        min_arity: min,
        max_arity: None,
        callable,
    }
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, Function> = {
        let mut functions = HashMap::new();
        let all = control()
            .into_iter()
            .chain(string::functions())
            .chain(codec::functions())
            .chain(digest::functions())
            .chain(math::functions())
            .chain(time::functions())
            .chain(header::functions())
            .chain(querystring::functions())
            .chain(objects::functions());
        for f in all {
            functions.insert(f.name, f);
        }
        functions
    };
}

pub fn lookup(name: &str) -> Option<&'static Function> {
    FUNCTIONS.get(name)
}

pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = FUNCTIONS.keys().copied().collect();
    names.sort_unstable();
    names
}

pub(crate) fn string_arg(args: &[Value], index: usize) -> String {
    args.get(index).map(Value::to_plain_string).unwrap_or_default()
}

pub(crate) fn vcl_arg(args: &[Value], index: usize) -> VclString {
    args.get(index)
        .map(Value::to_vcl_string)
        .unwrap_or(VclString::NotSet)
}

pub(crate) fn int_arg(args: &[Value], index: usize, default: i64) -> i64 {
    args.get(index).and_then(Value::to_i64).unwrap_or(default)
}

pub(crate) fn float_arg(args: &[Value], index: usize, default: f64) -> f64 {
    args.get(index).and_then(Value::to_f64).unwrap_or(default)
}

pub(crate) fn bool_arg(args: &[Value], index: usize) -> bool {
    args.get(index).map(Value::is_truthy).unwrap_or(false)
}

fn control() -> Vec<Function> {
    vec![
        function("std.log", 1, 1, log),
        function("std.error", 0, 2, error),
        function("std.synthetic", 1, 1, synthetic),
    ]
}

fn log(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let line = vcl_arg(args, 0).to_string();
    ctx.log(line);
    Ok(Value::not_set())
}

/// Same effect as the `error` statement once the current statement finishes.
fn error(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let status = int_arg(args, 0, 503);
    interpreter::raise_error(ctx, status, vcl_arg(args, 1));
    ctx.pending = Some(Action::Error);
    Ok(Value::not_set())
}

fn synthetic(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    interpreter::synthesize(ctx, string_arg(args, 0).into_bytes());
    Ok(Value::not_set())
}
