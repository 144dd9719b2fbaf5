//! Runtime management of backends, directors, ACLs and tables.

use std::time::Duration;

use crate::acl::{Acl, AclEntry};
use crate::context::Context;
use crate::error::EvalError;
use crate::expr;
use crate::interpreter::Function;
use crate::parse_probe::parse_probe;
use crate::registry::{director_kind, Backend, Director, ProbeConfig, Table, TableValue};
use crate::value::{duration_secs, Value, VclString};

use super::{bool_arg, float_arg, function, int_arg, string_arg, vcl_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("std.backend.add", 3, 4, backend_add),
        function("std.backend.remove", 1, 1, backend_remove),
        function("std.backend.exists", 1, 1, backend_exists),
        function("std.backend.is_healthy", 1, 1, backend_is_healthy),
        function("std.backend.set_healthy", 2, 2, backend_set_healthy),
        function("std.backend.add_probe", 2, 8, backend_add_probe),
        function("std.backend.set_current", 1, 1, backend_set_current),
        function("std.director.add", 2, 4, director_add),
        function("std.director.remove", 1, 1, director_remove),
        function("std.director.add_backend", 2, 3, director_add_backend),
        function("std.director.remove_backend", 2, 2, director_remove_backend),
        function("std.director.select_backend", 1, 1, director_select_backend),
        function("std.acl.add", 1, 1, acl_add),
        function("std.acl.remove", 1, 1, acl_remove),
        function("std.acl.add_entry", 2, 2, acl_add_entry),
        function("std.acl.remove_entry", 2, 2, acl_remove_entry),
        function("std.acl.check", 2, 2, acl_check),
        function("std.table.add", 1, 2, table_add),
        function("std.table.remove", 1, 1, table_remove),
        function("std.table.set", 3, 3, table_set),
        function("std.table.remove_key", 2, 2, table_remove_key),
        function("table.lookup", 2, 3, table_lookup),
        function("table.lookup_integer", 3, 3, table_lookup_integer),
        function("table.lookup_float", 3, 3, table_lookup_float),
        function("table.lookup_bool", 3, 3, table_lookup_bool),
        function("table.lookup_regex", 3, 3, table_lookup_regex),
        function("table.lookup_backend", 3, 3, table_lookup_backend),
        function("table.contains", 2, 2, table_contains),
    ]
}

/// `std.backend.add(name, host, port[, ssl])`
fn backend_add(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let host = string_arg(args, 1);
    let port = int_arg(args, 2, 0);
    if name.is_empty() || host.is_empty() || !(1..=65535).contains(&port) {
        return Ok(Value::Bool(false));
    }
    let mut backend = Backend::new(name, host, port as u16);
    backend.ssl = bool_arg(args, 3);
    ctx.registry.add_backend(backend);
    Ok(Value::Bool(true))
}

fn backend_remove(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.remove_backend(&string_arg(args, 0))))
}

fn backend_exists(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.has_backend(&string_arg(args, 0))))
}

fn backend_is_healthy(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.is_healthy(&string_arg(args, 0))))
}

fn backend_set_healthy(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    Ok(Value::Bool(ctx.registry.set_healthy(&name, bool_arg(args, 1))))
}

fn duration_arg(args: &[Value], index: usize, default: Duration) -> Duration {
    match args.get(index) {
        Some(value) if value.is_set() => Duration::from_secs(duration_secs(value).max(0) as u64),
        _ => default,
    }
}

/// `std.backend.add_probe(name, request, expected, interval, timeout,
/// window, threshold[, initial])`. Omitted arguments keep their defaults.
fn backend_add_probe(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let mut probe = ProbeConfig::default();

    let request = string_arg(args, 1);
    if !request.trim().is_empty() {
        let text = request.replace("\\r\\n", "\r\n");
        match parse_probe(&text) {
            Ok((_, parsed)) => probe.request = parsed,
            Err(_) => return Ok(Value::Bool(false)),
        }
    }
    probe.expected_response = int_arg(args, 2, 200).clamp(100, 999) as u16;
    probe.interval = duration_arg(args, 3, probe.interval);
    probe.timeout = duration_arg(args, 4, probe.timeout);
    probe.window = int_arg(args, 5, i64::from(probe.window)).clamp(1, 64) as u32;
    probe.threshold = (int_arg(args, 6, i64::from(probe.threshold)).max(0) as u32).min(probe.window);
    probe.initial = int_arg(args, 7, i64::from(probe.threshold)).max(0) as u32;

    Ok(Value::Bool(ctx.registry.add_probe(&name, probe)))
}

/// Points `req.backend` at a known backend or director.
fn backend_set_current(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    if !ctx.registry.has_backend(&name) && !ctx.registry.has_director(&name) {
        return Ok(Value::Bool(false));
    }
    ctx.current_backend = Some(name);
    Ok(Value::Bool(true))
}

/// `std.director.add(name, kind[, quorum, retries])`
fn director_add(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let kind = match director_kind(&string_arg(args, 1)) {
        Some(kind) if !name.is_empty() => kind,
        _ => return Ok(Value::Bool(false)),
    };
    let mut director = Director::new(name, kind);
    director.quorum = int_arg(args, 2, 0).clamp(0, 100) as u32;
    director.retries = int_arg(args, 3, i64::from(director.retries)).max(0) as u32;
    ctx.registry.add_director(director);
    Ok(Value::Bool(true))
}

fn director_remove(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.remove_director(&string_arg(args, 0))))
}

fn director_add_backend(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let director = string_arg(args, 0);
    let backend = string_arg(args, 1);
    if !ctx.registry.has_backend(&backend) {
        return Ok(Value::Bool(false));
    }
    let weight = int_arg(args, 2, 1).max(0) as u32;
    Ok(Value::Bool(
        ctx.registry.add_director_member(&director, &backend, weight),
    ))
}

fn director_remove_backend(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let director = string_arg(args, 0);
    let backend = string_arg(args, 1);
    Ok(Value::Bool(
        ctx.registry.remove_director_member(&director, &backend),
    ))
}

fn director_select_backend(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let identity = ctx.identity();
    Ok(VclString::from(ctx.registry.select_backend(&name, &ctx.hash_data, &identity)).into())
}

fn acl_add(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    if name.is_empty() || ctx.registry.has_acl(&name) {
        return Ok(Value::Bool(false));
    }
    ctx.registry.add_acl(Acl::new(name));
    Ok(Value::Bool(true))
}

fn acl_remove(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.remove_acl(&string_arg(args, 0))))
}

/// Entries use the declaration syntax: `"10.0.0.0/8"` or `"!10.0.0.1"`.
fn acl_add_entry(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    Ok(Value::Bool(match AclEntry::parse_text(&string_arg(args, 1)) {
        Some(entry) => ctx.registry.add_acl_entry(&name, entry),
        None => false,
    }))
}

fn acl_remove_entry(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    Ok(Value::Bool(match AclEntry::parse_text(&string_arg(args, 1)) {
        Some(entry) => ctx.registry.remove_acl_entry(&name, &entry),
        None => false,
    }))
}

fn acl_check(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let ip = string_arg(args, 1);
    Ok(Value::Bool(
        ctx.registry.acl_contains(&name, &ip).unwrap_or(false),
    ))
}

/// `std.table.add(name[, TYPE])`
fn table_add(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    if name.is_empty() || ctx.registry.has_table(&name) {
        return Ok(Value::Bool(false));
    }
    let value_type = match args.get(1) {
        Some(ty) => match expr::Type::from_name(&ty.to_plain_string().to_ascii_uppercase()) {
            Some(ty) => Some(ty),
            None => return Ok(Value::Bool(false)),
        },
        None => None,
    };
    ctx.registry.add_table(Table {
        name,
        value_type,
        ..Table::default()
    });
    Ok(Value::Bool(true))
}

fn table_remove(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(ctx.registry.remove_table(&string_arg(args, 0))))
}

fn table_set(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let key = string_arg(args, 1);
    let value = args.get(2).cloned().unwrap_or_else(Value::not_set);
    let value_type = ctx.registry.table_value_type(&name);
    Ok(Value::Bool(match TableValue::from_value(&value, value_type) {
        Some(value) => ctx.registry.table_set(&name, &key, value),
        None => false,
    }))
}

fn table_remove_key(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let name = string_arg(args, 0);
    let key = string_arg(args, 1);
    Ok(Value::Bool(ctx.registry.table_remove_key(&name, &key)))
}

/// Without a default a missing key reads as unset.
fn table_lookup(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let default = vcl_arg(args, 2);
    let value = ctx
        .registry
        .lookup_string(&string_arg(args, 0), &string_arg(args, 1), default);
    Ok(value.into())
}

fn table_lookup_integer(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let default = int_arg(args, 2, 0);
    Ok(Value::Integer(ctx.registry.lookup_integer(
        &string_arg(args, 0),
        &string_arg(args, 1),
        default,
    )))
}

fn table_lookup_float(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let default = float_arg(args, 2, 0.0);
    Ok(Value::Float(ctx.registry.lookup_float(
        &string_arg(args, 0),
        &string_arg(args, 1),
        default,
    )))
}

fn table_lookup_bool(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let default = bool_arg(args, 2);
    Ok(Value::Bool(ctx.registry.lookup_bool(
        &string_arg(args, 0),
        &string_arg(args, 1),
        default,
    )))
}

fn table_lookup_regex(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let default = string_arg(args, 2);
    Ok(Value::str(ctx.registry.lookup_regex(
        &string_arg(args, 0),
        &string_arg(args, 1),
        &default,
    )))
}

fn table_lookup_backend(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let table = string_arg(args, 0);
    let key = string_arg(args, 1);
    Ok(match ctx.registry.table_get(&table, &key) {
        Some(TableValue::Backend(name)) | Some(TableValue::String(name)) => Value::str(name),
        _ => args.get(2).cloned().unwrap_or_else(Value::not_set),
    })
}

fn table_contains(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(
        ctx.registry
            .table_contains(&string_arg(args, 0), &string_arg(args, 1)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::tests::{call, ctx};

    fn s(v: &str) -> Value {
        Value::str(v)
    }

    #[test]
    fn test_backend_lifecycle() {
        let mut ctx = ctx();
        assert_eq!(
            call(&mut ctx, "std.backend.add", &[s("origin"), s("example.com"), Value::Integer(443), Value::Bool(true)]),
            Value::Bool(true)
        );
        assert_eq!(call(&mut ctx, "std.backend.add", &[s("bad"), s("h"), Value::Integer(0)]), Value::Bool(false));
        assert!(ctx.registry.get_backend("origin").unwrap().ssl);
        assert_eq!(call(&mut ctx, "std.backend.is_healthy", &[s("origin")]), Value::Bool(true));
        call(&mut ctx, "std.backend.set_healthy", &[s("origin"), Value::Bool(false)]);
        assert_eq!(call(&mut ctx, "std.backend.is_healthy", &[s("origin")]), Value::Bool(false));
        assert_eq!(call(&mut ctx, "std.backend.set_current", &[s("origin")]), Value::Bool(true));
        assert_eq!(ctx.current_backend.as_deref(), Some("origin"));
        assert_eq!(call(&mut ctx, "std.backend.set_current", &[s("ghost")]), Value::Bool(false));
        assert_eq!(call(&mut ctx, "std.backend.remove", &[s("origin")]), Value::Bool(true));
        assert_eq!(call(&mut ctx, "std.backend.exists", &[s("origin")]), Value::Bool(false));
    }

    #[test]
    fn test_add_probe() {
        let mut ctx = ctx();
        call(&mut ctx, "std.backend.add", &[s("a"), s("a.example"), Value::Integer(80)]);
        let added = call(
            &mut ctx,
            "std.backend.add_probe",
            &[
                s("a"),
                s("GET /health HTTP/1.1\r\nHost: a.example\r\n"),
                Value::Integer(204),
                s("10s"),
                s("1s"),
                Value::Integer(4),
                Value::Integer(2),
                Value::Integer(0),
            ],
        );
        assert_eq!(added, Value::Bool(true));
        let backend = ctx.registry.get_backend("a").unwrap();
        let probe = backend.probe.as_ref().unwrap();
        assert_eq!(probe.request.path, "/health");
        assert_eq!(probe.expected_response, 204);
        assert_eq!(probe.interval, Duration::from_secs(10));
        assert_eq!(probe.window, 4);
        assert!(!backend.is_healthy());
    }

    #[test]
    fn test_director_functions() {
        let mut ctx = ctx();
        call(&mut ctx, "std.backend.add", &[s("a"), s("a"), Value::Integer(80)]);
        call(&mut ctx, "std.backend.add", &[s("b"), s("b"), Value::Integer(80)]);
        assert_eq!(call(&mut ctx, "std.director.add", &[s("d"), s("fallback")]), Value::Bool(true));
        assert_eq!(call(&mut ctx, "std.director.add", &[s("x"), s("nonsense")]), Value::Bool(false));
        call(&mut ctx, "std.director.add_backend", &[s("d"), s("a")]);
        call(&mut ctx, "std.director.add_backend", &[s("d"), s("b")]);
        assert_eq!(call(&mut ctx, "std.director.select_backend", &[s("d")]), s("a"));
        call(&mut ctx, "std.director.remove_backend", &[s("d"), s("a")]);
        assert_eq!(call(&mut ctx, "std.director.select_backend", &[s("d")]), s("b"));
        call(&mut ctx, "std.backend.set_healthy", &[s("b"), Value::Bool(false)]);
        assert_eq!(call(&mut ctx, "std.director.select_backend", &[s("d")]), Value::not_set());
    }

    #[test]
    fn test_acl_functions() {
        let mut ctx = ctx();
        assert_eq!(call(&mut ctx, "std.acl.add", &[s("office")]), Value::Bool(true));
        assert_eq!(call(&mut ctx, "std.acl.add", &[s("office")]), Value::Bool(false));
        call(&mut ctx, "std.acl.add_entry", &[s("office"), s("10.0.0.0/8")]);
        assert_eq!(call(&mut ctx, "std.acl.check", &[s("office"), s("10.2.3.4")]), Value::Bool(true));
        call(&mut ctx, "std.acl.remove_entry", &[s("office"), s("10.0.0.0/8")]);
        assert_eq!(call(&mut ctx, "std.acl.check", &[s("office"), s("10.2.3.4")]), Value::Bool(false));
        assert_eq!(call(&mut ctx, "std.acl.check", &[s("nope"), s("10.2.3.4")]), Value::Bool(false));
    }

    #[test]
    fn test_table_functions() {
        let mut ctx = ctx();
        call(&mut ctx, "std.table.add", &[s("limits"), s("INTEGER")]);
        call(&mut ctx, "std.table.set", &[s("limits"), s("max"), s("10")]);
        assert_eq!(
            call(&mut ctx, "table.lookup_integer", &[s("limits"), s("max"), Value::Integer(1)]),
            Value::Integer(10)
        );
        assert_eq!(
            call(&mut ctx, "table.lookup_integer", &[s("limits"), s("min"), Value::Integer(1)]),
            Value::Integer(1)
        );
        assert_eq!(call(&mut ctx, "table.lookup", &[s("limits"), s("max")]), s("10"));
        assert_eq!(call(&mut ctx, "table.lookup", &[s("limits"), s("zz")]), Value::not_set());
        assert_eq!(call(&mut ctx, "table.contains", &[s("limits"), s("max")]), Value::Bool(true));
        assert_eq!(
            call(&mut ctx, "std.table.set", &[s("limits"), s("bad"), s("abc")]),
            Value::Bool(false)
        );
        call(&mut ctx, "std.table.remove_key", &[s("limits"), s("max")]);
        assert_eq!(call(&mut ctx, "table.contains", &[s("limits"), s("max")]), Value::Bool(false));
    }
}
