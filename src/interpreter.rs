use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::context::Context;
use crate::error::EvalError;
use crate::expr::{self, Program};
use crate::stdlib;
use crate::value::{time_from_secs, Fill, Value, VclString};

const MAX_CALL_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Lookup,
    Pass,
    Fetch,
    Deliver,
    DeliverStale,
    Error,
    Restart,
    Hash,
    Pipe,
}

impl Action {
    pub fn parse(name: &str) -> Option<Action> {
        Some(match name {
            "lookup" => Action::Lookup,
            "pass" => Action::Pass,
            "fetch" => Action::Fetch,
            "deliver" => Action::Deliver,
            "deliver_stale" => Action::DeliverStale,
            "error" => Action::Error,
            "restart" => Action::Restart,
            "hash" => Action::Hash,
            "pipe" => Action::Pipe,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Lookup => "lookup",
            Action::Pass => "pass",
            Action::Fetch => "fetch",
            Action::Deliver => "deliver",
            Action::DeliverStale => "deliver_stale",
            Action::Error => "error",
            Action::Restart => "restart",
            Action::Hash => "hash",
            Action::Pipe => "pipe",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The lifecycle subroutines the pipeline invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubName {
    Recv,
    Hash,
    Hit,
    Miss,
    Pass,
    Fetch,
    Deliver,
    Error,
    Log,
}

impl SubName {
    pub fn name(&self) -> &'static str {
        match self {
            SubName::Recv => "vcl_recv",
            SubName::Hash => "vcl_hash",
            SubName::Hit => "vcl_hit",
            SubName::Miss => "vcl_miss",
            SubName::Pass => "vcl_pass",
            SubName::Fetch => "vcl_fetch",
            SubName::Deliver => "vcl_deliver",
            SubName::Error => "vcl_error",
            SubName::Log => "vcl_log",
        }
    }

    /// Returned when the subroutine finishes without `return`.
    pub fn default_action(&self) -> Action {
        match self {
            SubName::Recv => Action::Lookup,
            SubName::Hash => Action::Hash,
            SubName::Hit | SubName::Miss | SubName::Pass => Action::Fetch,
            SubName::Fetch | SubName::Deliver | SubName::Error | SubName::Log => Action::Deliver,
        }
    }

    /// Returned when the program does not define the subroutine at all.
    pub fn builtin_action(&self) -> Action {
        match self {
            SubName::Hit => Action::Deliver,
            other => other.default_action(),
        }
    }

    /// Returned when evaluation fails part way through.
    pub fn fallback_action(&self) -> Action {
        match self {
            SubName::Recv
            | SubName::Hash
            | SubName::Hit
            | SubName::Miss
            | SubName::Pass
            | SubName::Fetch => Action::Error,
            SubName::Deliver | SubName::Error | SubName::Log => Action::Deliver,
        }
    }
}

pub enum Flow {
    Next,
    Return(Option<Action>),
}

#[derive(Default)]
struct Subs(HashMap<String, Vec<StmtFn>>);

impl Deref for Subs {
    type Target = HashMap<String, Vec<StmtFn>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Subs {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

type ExprFn = Box<dyn Fn(&mut Context) -> Result<Value, EvalError> + Send + Sync>;
type StmtFn = Box<dyn Fn(&mut Context, &Subs) -> Result<Flow, EvalError> + Send + Sync>;

pub trait Callable {
    fn arity(&self) -> (usize, Option<usize>);
    fn call(&self, ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError>;
}

#[derive(Clone)]
pub struct Function {
    pub name: &'static str,
    pub min_arity: usize,
    pub max_arity: Option<usize>,
    pub callable: fn(&mut Context, &[Value]) -> Result<Value, EvalError>,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name)
    }
}

impl Callable for Function {
    fn arity(&self) -> (usize, Option<usize>) {
        (self.min_arity, self.max_arity)
    }
    fn call(&self, ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
        (self.callable)(ctx, args)
    }
}

fn check_arity(
    callable: &dyn Callable,
    name: &str,
    found: usize,
    sym: &expr::Symbol,
) -> Result<(), EvalError> {
    let (min, max) = callable.arity();
    let fits = found >= min && max.map(|max| found <= max).unwrap_or(true);
    if fits {
        return Ok(());
    }
    let expected = match max {
        Some(max) if max == min => min.to_string(),
        Some(max) => format!("{}..{}", min, max),
        None => format!("at least {}", min),
    };
    Err(EvalError::Arity {
        name: name.to_string(),
        expected,
        found,
        line: sym.line,
        col: sym.col,
    })
}

/// Every subroutine of a program bound to closures over its AST.
pub struct CompiledProgram {
    subs: Subs,
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.subs.keys().collect();
        names.sort();
        write!(f, "CompiledProgram({:?})", names)
    }
}

impl CompiledProgram {
    /// Repeated definitions of one subroutine run in declaration order.
    pub fn compile(program: &Program) -> CompiledProgram {
        let mut subs = Subs::default();
        for sub in program.subroutines() {
            let body = subs.entry(sub.name.name.clone()).or_insert_with(Vec::new);
            body.extend(sub.body.iter().map(compile_stmt));
        }
        CompiledProgram { subs }
    }

    pub fn has(&self, name: &str) -> bool {
        self.subs.contains_key(name)
    }

    pub fn run(&self, sub: SubName, ctx: &mut Context) -> Action {
        let body = match self.subs.get(sub.name()) {
            Some(body) => body,
            None => return sub.builtin_action(),
        };
        ctx.pending = None;
        ctx.call_depth = 0;
        match run_block(body, ctx, &self.subs) {
            Ok(Flow::Return(Some(action))) => action,
            Ok(_) => sub.default_action(),
            Err(err) => {
                let action = sub.fallback_action();
                let line = format!("{}: {}; falling back to {}", sub.name(), err, action);
                eprintln!("{}", line);
                ctx.log(line);
                action
            }
        }
    }
}

fn run_block(stmts: &[StmtFn], ctx: &mut Context, subs: &Subs) -> Result<Flow, EvalError> {
    for stmt in stmts {
        if let Flow::Return(action) = stmt(ctx, subs)? {
            return Ok(Flow::Return(action));
        }
        if let Some(action) = ctx.pending.take() {
            return Ok(Flow::Return(Some(action)));
        }
    }
    Ok(Flow::Next)
}

fn fill_for(target: &str) -> Fill {
    if target.starts_with("var.") {
        Fill::Empty
    } else {
        Fill::Null
    }
}

fn target_path(target: &expr::Expr) -> String {
    target.path().unwrap_or_default()
}

fn compile_block(stmts: &[expr::Stmt]) -> StmtFn {
    let stmts: Vec<StmtFn> = stmts.iter().map(compile_stmt).collect();
    Box::new(move |ctx, subs| run_block(&stmts, ctx, subs))
}

fn compile_stmt(stmt: &expr::Stmt) -> StmtFn {
    match stmt {
        expr::Stmt::Expr(e) => {
            let e = compile_expr(e, Fill::Null);
            Box::new(move |ctx, _| {
                e(ctx)?;
                Ok(Flow::Next)
            })
        }
        expr::Stmt::If(cond, if_true, maybe_if_false) => {
            let cond = compile_expr(cond, Fill::Null);
            let if_true = compile_stmt(if_true);
            let if_false = maybe_if_false.as_ref().map(|stmt| compile_stmt(stmt));
            Box::new(move |ctx, subs| {
                if cond(ctx)?.is_truthy() {
                    return if_true(ctx, subs);
                }
                match &if_false {
                    Some(if_false) => if_false(ctx, subs),
                    None => Ok(Flow::Next),
                }
            })
        }
        expr::Stmt::Block(stmts) => compile_block(stmts),
        expr::Stmt::VarDecl(sym) => {
            let name = sym.name.clone();
            let ty = sym.var_type.unwrap_or(expr::Type::String);
            Box::new(move |ctx, _| {
                ctx.declare(&name, ty);
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Return(_, sym) => {
            let action = sym.as_ref().and_then(|sym| Action::parse(&sym.name));
            Box::new(move |_, _| Ok(Flow::Return(action)))
        }
        expr::Stmt::Call(sym) => {
            let name = sym.name.clone();
            Box::new(move |ctx, subs| {
                let body = subs
                    .get(&name)
                    .ok_or_else(|| EvalError::UnknownSub(name.clone()))?;
                if ctx.call_depth >= MAX_CALL_DEPTH {
                    return Err(EvalError::CallDepth(name.clone()));
                }
                ctx.call_depth += 1;
                let result = run_block(body, ctx, subs);
                ctx.call_depth -= 1;
                match result? {
                    Flow::Return(Some(action)) => Ok(Flow::Return(Some(action))),
                    _ => Ok(Flow::Next),
                }
            })
        }
        expr::Stmt::Goto(_) | expr::Stmt::Label(_) => Box::new(|_, _| Ok(Flow::Next)),
        expr::Stmt::Esi(_) => Box::new(|ctx, _| {
            ctx.esi = true;
            Ok(Flow::Next)
        }),
        expr::Stmt::Log(e) => {
            let e = compile_expr(e, Fill::Null);
            Box::new(move |ctx, _| {
                let line = e(ctx)?.to_string();
                ctx.log(line);
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Restart(_) => Box::new(|_, _| Ok(Flow::Return(Some(Action::Restart)))),
        expr::Stmt::Error(err, _) => {
            let status = err.status.as_ref().map(|e| compile_expr(e, Fill::Null));
            let message = err.message.as_ref().map(|e| compile_expr(e, Fill::Null));
            Box::new(move |ctx, _| {
                let code = match &status {
                    Some(status) => status(ctx)?.to_i64().unwrap_or(503),
                    None => 503,
                };
                let text = match &message {
                    Some(message) => message(ctx)?.to_vcl_string(),
                    None => VclString::NotSet,
                };
                raise_error(ctx, code, text);
                Ok(Flow::Return(Some(Action::Error)))
            })
        }
        expr::Stmt::HashData(e) => {
            let e = compile_expr(e, Fill::Null);
            Box::new(move |ctx, _| {
                let value = e(ctx)?;
                ctx.hash_data.push(stdlib::digest::sha256_hex(value.to_plain_string().as_bytes()));
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Add(target, value) => {
            let path = target_path(target);
            let value = compile_expr(value, Fill::Null);
            Box::new(move |ctx, _| {
                let value = value(ctx)?;
                ctx.add_header(&path, value);
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Set(target, assignment, value) => {
            let path = target_path(target);
            let value = compile_expr(value, fill_for(&path));
            let assignment = *assignment;
            Box::new(move |ctx, _| {
                let rhs = value(ctx)?;
                let new_value = match assignment {
                    expr::Assignment::Assign => rhs,
                    op => apply_assignment(op, &ctx.get_var(&path), &rhs, fill_for(&path))?,
                };
                ctx.set_var(&path, new_value)?;
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Unset(target) => {
            let path = target_path(target);
            Box::new(move |ctx, _| {
                ctx.unset_var(&path);
                Ok(Flow::Next)
            })
        }
        expr::Stmt::Synthetic(e) => {
            let e = compile_expr(e, Fill::Null);
            Box::new(move |ctx, _| {
                let body = e(ctx)?.to_plain_string().into_bytes();
                synthesize(ctx, body);
                Ok(Flow::Next)
            })
        }
        expr::Stmt::SyntheticBase64(e) => {
            let e = compile_expr(e, Fill::Null);
            Box::new(move |ctx, _| {
                let encoded = e(ctx)?.to_plain_string();
                let body = base64::decode(encoded.trim())
                    .map_err(|err| EvalError::Function(format!("synthetic.base64: {}", err)))?;
                synthesize(ctx, body);
                Ok(Flow::Next)
            })
        }
    }
}

/// Shared by the `error` statement and `std.error`.
pub fn raise_error(ctx: &mut Context, status: i64, message: VclString) {
    ctx.obj.status = if (100..=999).contains(&status) {
        status as u16
    } else {
        503
    };
    ctx.obj.response = message;
    ctx.fastly_error = true;
}

pub fn synthesize(ctx: &mut Context, body: Vec<u8>) {
    ctx.obj.body = body;
    if !ctx.obj.headers.contains("content-type") {
        ctx.obj.headers.set("content-type", "text/html; charset=utf-8");
    }
}

fn literal_value(lit: &expr::Literal) -> Value {
    match lit {
        expr::Literal::String(s) => Value::str(s.clone()),
        expr::Literal::True => Value::Bool(true),
        expr::Literal::False => Value::Bool(false),
        expr::Literal::Float(n) => Value::Float(*n),
        expr::Literal::Integer(n) | expr::Literal::Percent(n) => Value::Integer(*n),
    }
}

fn compile_expr(e: &expr::Expr, fill: Fill) -> ExprFn {
    match e {
        expr::Expr::Literal(lit, _) => {
            let value = literal_value(lit);
            Box::new(move |_| Ok(value.clone()))
        }
        expr::Expr::Regex(pattern, _) => {
            let value = Value::str(pattern.clone());
            Box::new(move |_| Ok(value.clone()))
        }
        expr::Expr::Grouping(inner) => compile_expr(inner, fill),
        expr::Expr::Variable(sym) => {
            let name = sym.name.clone();
            Box::new(move |ctx| Ok(ctx.get_var(&name)))
        }
        expr::Expr::Get(object, _) => match e.path() {
            Some(path) => Box::new(move |ctx| Ok(ctx.get_var(&path))),
            None => {
                let object = compile_expr(object, fill);
                Box::new(move |ctx| {
                    object(ctx)?;
                    Ok(Value::not_set())
                })
            }
        },
        expr::Expr::Unary(op, inner) => {
            let inner = compile_expr(inner, fill);
            match op.ty {
                expr::UnaryOpTy::Bang => Box::new(move |ctx| Ok(Value::Bool(!inner(ctx)?.is_truthy()))),
                expr::UnaryOpTy::Minus => Box::new(move |ctx| negate(inner(ctx)?)),
            }
        }
        expr::Expr::Logical(lhs, op, rhs) => {
            let lhs = compile_expr(lhs, fill);
            let rhs = compile_expr(rhs, fill);
            match op {
                expr::LogicalOp::Or => Box::new(move |ctx| {
                    if lhs(ctx)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(rhs(ctx)?.is_truthy()))
                }),
                expr::LogicalOp::And => Box::new(move |ctx| {
                    if !lhs(ctx)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(rhs(ctx)?.is_truthy()))
                }),
            }
        }
        expr::Expr::Ternary(cond, then, otherwise, _) => {
            let cond = compile_expr(cond, fill);
            let then = compile_expr(then, fill);
            let otherwise = compile_expr(otherwise, fill);
            Box::new(move |ctx| {
                if cond(ctx)?.is_truthy() {
                    then(ctx)
                } else {
                    otherwise(ctx)
                }
            })
        }
        expr::Expr::Call(sym, args) => compile_call(sym, args, fill),
        expr::Expr::Binary(lhs, op, rhs) => match op.ty {
            expr::BinaryOpTy::Match | expr::BinaryOpTy::NotMatch => {
                compile_match(lhs, op.ty == expr::BinaryOpTy::NotMatch, rhs)
            }
            expr::BinaryOpTy::Concat | expr::BinaryOpTy::Plus => compile_chain(e, fill),
            ty => {
                let lhs = compile_expr(lhs, fill);
                let rhs = compile_expr(rhs, fill);
                Box::new(move |ctx| {
                    let l = lhs(ctx)?;
                    let r = rhs(ctx)?;
                    binary(ty, &l, &r, fill)
                })
            }
        },
    }
}

/// Collects a left-leaning run of `+` and concatenation nodes. Only a
/// concatenation is flattened on its right side; `a + b c` keeps `b c` whole.
fn flatten_chain<'a>(
    e: &'a expr::Expr,
    op: Option<expr::BinaryOpTy>,
    parts: &mut Vec<(Option<expr::BinaryOpTy>, &'a expr::Expr)>,
) {
    use expr::BinaryOpTy::{Concat, Plus};
    match e {
        expr::Expr::Binary(lhs, bin, rhs) if matches!(bin.ty, Concat | Plus) => {
            flatten_chain(lhs, op, parts);
            if bin.ty == Concat {
                flatten_concat(rhs, parts);
            } else {
                parts.push((Some(Plus), rhs.as_ref()));
            }
        }
        _ => parts.push((op, e)),
    }
}

fn flatten_concat<'a>(
    e: &'a expr::Expr,
    parts: &mut Vec<(Option<expr::BinaryOpTy>, &'a expr::Expr)>,
) {
    match e {
        expr::Expr::Binary(lhs, bin, rhs) if bin.ty == expr::BinaryOpTy::Concat => {
            flatten_concat(lhs, parts);
            flatten_concat(rhs, parts);
        }
        _ => parts.push((Some(expr::BinaryOpTy::Concat), e)),
    }
}

enum Chain {
    Value(Value),
    Run(Vec<VclString>),
}

fn compile_chain(e: &expr::Expr, fill: Fill) -> ExprFn {
    let mut flat = Vec::new();
    flatten_chain(e, None, &mut flat);
    let parts: Vec<(expr::BinaryOpTy, ExprFn)> = flat
        .into_iter()
        .map(|(op, part)| (op.unwrap_or(expr::BinaryOpTy::Concat), compile_expr(part, fill)))
        .collect();

    Box::new(move |ctx| {
        let mut acc: Option<Chain> = None;
        for (op, part) in &parts {
            let value = part(ctx)?;
            acc = Some(match acc {
                None => Chain::Value(value),
                Some(Chain::Run(mut run)) => {
                    run.push(value.to_vcl_string());
                    Chain::Run(run)
                }
                Some(Chain::Value(lhs))
                    if *op == expr::BinaryOpTy::Concat
                        || matches!(lhs, Value::String(_))
                        || matches!(value, Value::String(_)) =>
                {
                    Chain::Run(vec![lhs.to_vcl_string(), value.to_vcl_string()])
                }
                Some(Chain::Value(lhs)) => Chain::Value(arithmetic(*op, &lhs, &value)?),
            });
        }
        Ok(match acc {
            Some(Chain::Run(run)) => Value::String(VclString::join(&run, fill)),
            Some(Chain::Value(value)) => value,
            None => Value::not_set(),
        })
    })
}

fn compile_call(sym: &expr::Symbol, args: &[expr::Expr], fill: Fill) -> ExprFn {
    let args: Vec<ExprFn> = args.iter().map(|arg| compile_expr(arg, fill)).collect();
    let sym = sym.clone();

    match stdlib::lookup(&sym.name) {
        Some(function) => Box::new(move |ctx| {
            let values = args.iter().map(|arg| arg(ctx)).collect::<Result<Vec<_>, _>>()?;
            check_arity(function, &sym.name, values.len(), &sym)?;
            function.call(ctx, &values)
        }),
        None => Box::new(move |ctx| {
            let function = stdlib::lookup(&sym.name).ok_or_else(|| EvalError::UnknownFunction {
                name: sym.name.clone(),
                line: sym.line,
                col: sym.col,
            })?;
            let values = args.iter().map(|arg| arg(ctx)).collect::<Result<Vec<_>, _>>()?;
            check_arity(function, &sym.name, values.len(), &sym)?;
            function.call(ctx, &values)
        }),
    }
}

/// Stores capture groups from a successful match; a failed match clears them.
pub fn capture(ctx: &mut Context, re: &Regex, subject: &str) -> bool {
    match re.captures(subject) {
        Some(captures) => {
            ctx.re_groups = captures
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect();
            true
        }
        None => {
            ctx.re_groups.clear();
            false
        }
    }
}

pub fn compile_regex(pattern: &str) -> Result<Regex, EvalError> {
    Regex::new(pattern).map_err(|err| EvalError::Regex {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

fn compile_match(lhs: &expr::Expr, negate: bool, rhs: &expr::Expr) -> ExprFn {
    let subject = compile_expr(lhs, Fill::Null);

    match rhs {
        expr::Expr::Regex(pattern, _) => match compile_regex(pattern) {
            Ok(re) => Box::new(move |ctx| {
                let text = subject(ctx)?.to_plain_string();
                Ok(Value::Bool(capture(ctx, &re, &text) != negate))
            }),
            Err(err) => Box::new(move |_| Err(err.clone())),
        },
        expr::Expr::Variable(sym) => {
            let name = sym.name.clone();
            Box::new(move |ctx| {
                let text = subject(ctx)?.to_plain_string();
                if let Some(found) = ctx.registry.acl_contains(&name, &text) {
                    return Ok(Value::Bool(found != negate));
                }
                let re = compile_regex(&ctx.get_var(&name).to_plain_string())?;
                Ok(Value::Bool(capture(ctx, &re, &text) != negate))
            })
        }
        other => {
            let pattern = compile_expr(other, Fill::Null);
            Box::new(move |ctx| {
                let text = subject(ctx)?.to_plain_string();
                let re = compile_regex(&pattern(ctx)?.to_plain_string())?;
                Ok(Value::Bool(capture(ctx, &re, &text) != negate))
            })
        }
    }
}

fn int_to_float(b: i64) -> Result<f64, EvalError> {
    let bf: Option<f64> = num_traits::cast::FromPrimitive::from_i64(b);
    match bf {
        Some(bf) if bf as i64 == b => Ok(bf),
        _ => Err(EvalError::Coercion {
            value: b.to_string(),
            to: "FLOAT",
        }),
    }
}

fn as_float(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Integer(n) => int_to_float(*n),
        other => other.to_f64().ok_or_else(|| EvalError::Coercion {
            value: other.to_string(),
            to: "FLOAT",
        }),
    }
}

fn as_integer(value: &Value) -> Result<i64, EvalError> {
    value.to_i64().ok_or_else(|| EvalError::Coercion {
        value: value.to_string(),
        to: "INTEGER",
    })
}

fn negate(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Integer(n) => Ok(Value::Integer(n.wrapping_neg())),
        Value::Float(n) => Ok(Value::Float(-n)),
        other => Ok(Value::Float(-as_float(&other)?)),
    }
}

fn binary(op: expr::BinaryOpTy, lhs: &Value, rhs: &Value, fill: Fill) -> Result<Value, EvalError> {
    use expr::BinaryOpTy::*;
    match op {
        EqualEqual => Ok(Value::Bool(lhs.loose_eq(rhs))),
        NotEqual => Ok(Value::Bool(!lhs.loose_eq(rhs))),
        Less | LessEqual | Greater | GreaterEqual => {
            let ordering = lhs.loose_cmp(rhs);
            Ok(Value::Bool(match (op, ordering) {
                (_, None) => false,
                (Less, Some(o)) => o.is_lt(),
                (LessEqual, Some(o)) => o.is_le(),
                (Greater, Some(o)) => o.is_gt(),
                (_, Some(o)) => o.is_ge(),
            }))
        }
        Concat => Ok(Value::String(lhs.to_vcl_string().concat(&rhs.to_vcl_string(), fill))),
        Plus if matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)) => {
            Ok(Value::String(lhs.to_vcl_string().concat(&rhs.to_vcl_string(), fill)))
        }
        Plus | Minus | Star | Slash | Percent => arithmetic(op, lhs, rhs),
        Match | NotMatch => Err(EvalError::Function("match operator outside a condition".into())),
    }
}

fn arithmetic(op: expr::BinaryOpTy, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use expr::BinaryOpTy::*;
    match (lhs, rhs) {
        (Value::Time(t), other) | (other, Value::Time(t)) if matches!(op, Plus) => {
            let secs = t.timestamp_millis() as f64 / 1000.0 + as_float(other)?;
            time_from_secs(secs).map(Value::Time).ok_or_else(|| EvalError::Coercion {
                value: secs.to_string(),
                to: "TIME",
            })
        }
        (Value::Time(a), Value::Time(b)) if matches!(op, Minus) => {
            Ok(Value::Float((a.timestamp_millis() - b.timestamp_millis()) as f64 / 1000.0))
        }
        (Value::Time(t), other) if matches!(op, Minus) => {
            let secs = t.timestamp_millis() as f64 / 1000.0 - as_float(other)?;
            time_from_secs(secs).map(Value::Time).ok_or_else(|| EvalError::Coercion {
                value: secs.to_string(),
                to: "TIME",
            })
        }
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            Ok(Value::Integer(match op {
                Plus => a.wrapping_add(b),
                Minus => a.wrapping_sub(b),
                Star => a.wrapping_mul(b),
                Slash | Percent if b == 0 => {
                    return Err(EvalError::Function("integer division by zero".into()))
                }
                Slash => a.wrapping_div(b),
                _ => a.wrapping_rem_euclid(b),
            }))
        }
        _ => {
            let (a, b) = (as_float(lhs)?, as_float(rhs)?);
            Ok(Value::Float(match op {
                Plus => a + b,
                Minus => a - b,
                Star => a * b,
                Slash => a / b,
                _ => a.rem_euclid(b),
            }))
        }
    }
}

/// `set x op= y` reads `x`, combines, and writes the result back.
fn apply_assignment(
    op: expr::Assignment,
    current: &Value,
    rhs: &Value,
    fill: Fill,
) -> Result<Value, EvalError> {
    use expr::Assignment::*;
    let numeric = |ty| binary(ty, current, rhs, fill);
    match op {
        Assign => Ok(rhs.clone()),
        Addition => numeric(expr::BinaryOpTy::Plus),
        Subtraction => numeric(expr::BinaryOpTy::Minus),
        Multiplication => numeric(expr::BinaryOpTy::Star),
        Division => numeric(expr::BinaryOpTy::Slash),
        Modulus => numeric(expr::BinaryOpTy::Percent),
        LogicalAnd => Ok(Value::Bool(current.is_truthy() && rhs.is_truthy())),
        LogicalOr => Ok(Value::Bool(current.is_truthy() || rhs.is_truthy())),
        BitwiseOr | BitwiseAnd | BitwiseXor | LeftShift | RightShift | LeftRotate
        | RightRotate => {
            let (a, b) = (as_integer(current)?, as_integer(rhs)?);
            let shift = (b.rem_euclid(64)) as u32;
            Ok(Value::Integer(match op {
                BitwiseOr => a | b,
                BitwiseAnd => a & b,
                BitwiseXor => a ^ b,
                LeftShift => a.wrapping_shl(shift),
                RightShift => a.wrapping_shr(shift),
                LeftRotate => a.rotate_left(shift),
                _ => a.rotate_right(shift),
            }))
        }
    }
}

/// Parses and compiles source text in one step.
pub fn compile_source(source: &str) -> Result<Arc<CompiledProgram>, crate::parser::ParseError> {
    let program = crate::parser::parse(crate::scanner::scan_tokens(source))?;
    Ok(Arc::new(CompiledProgram::compile(&program)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Request;
    use crate::registry::Registry;

    fn run(source: &str, sub: SubName, ctx: &mut Context) -> Action {
        let program = compile_source(source).unwrap();
        program.run(sub, ctx)
    }

    fn context(url: &str) -> Context {
        let req = Request {
            url: url.to_string(),
            ..Request::default()
        };
        Context::new(Arc::new(Registry::new()), req)
    }

    #[test]
    fn test_default_actions() {
        let mut ctx = context("/");
        assert_eq!(run("sub vcl_recv { }", SubName::Recv, &mut ctx), Action::Lookup);
        assert_eq!(run("sub vcl_recv { }", SubName::Hit, &mut ctx), Action::Deliver);
        assert_eq!(run("sub vcl_miss { }", SubName::Miss, &mut ctx), Action::Fetch);
        assert_eq!(run("sub vcl_recv { return(pass); }", SubName::Recv, &mut ctx), Action::Pass);
    }

    #[test]
    fn test_capture_groups_visible_in_branch() {
        let mut ctx = context("/api/users");
        let source = r#"
            sub vcl_recv {
                if (req.url ~ "^/(api)/") {
                    set req.http.X-Match = re.group.0;
                    set req.http.X-Group = re.group.1;
                }
            }
        "#;
        run(source, SubName::Recv, &mut ctx);
        assert_eq!(ctx.req.headers.get("x-match"), Some("/api/"));
        assert_eq!(ctx.req.headers.get("x-group"), Some("api"));
    }

    #[test]
    fn test_concat_fill_modes() {
        let mut ctx = context("/");
        let source = r#"
            sub vcl_recv {
                declare local var.s STRING;
                set var.s = "a" req.http.Missing "b";
                set req.http.X-Local = var.s;
                set req.http.X-Header = "a" req.http.Missing "b";
                set req.http.X-Unset = req.http.Missing req.http.Other;
            }
        "#;
        run(source, SubName::Recv, &mut ctx);
        assert_eq!(ctx.req.headers.get("x-local"), Some("ab"));
        assert_eq!(ctx.req.headers.get("x-header"), Some("a(null)b"));
        assert!(!ctx.req.headers.contains("x-unset"));
    }

    #[test]
    fn test_concat_fills_every_unset_part() {
        let mut ctx = context("/");
        let source = r#"
            sub vcl_recv {
                declare local var.s STRING;
                set var.s = req.http.A req.http.B "x";
                set req.http.X-Local = var.s;
                set req.http.X-Header = req.http.A req.http.B "x";
                set req.http.X-Plus = req.http.A + req.http.B + "x";
                set req.http.X-Sum = 1 + 2 "x";
                set req.http.X-None = req.http.A req.http.B req.http.C;
            }
        "#;
        run(source, SubName::Recv, &mut ctx);
        assert_eq!(ctx.req.headers.get("x-local"), Some("x"));
        assert_eq!(ctx.req.headers.get("x-header"), Some("(null)(null)x"));
        assert_eq!(ctx.req.headers.get("x-plus"), Some("(null)(null)x"));
        assert_eq!(ctx.req.headers.get("x-sum"), Some("12x"));
        assert!(!ctx.req.headers.contains("x-none"));
    }

    #[test]
    fn test_compound_assignment() {
        let mut ctx = context("/");
        let source = r#"
            sub vcl_recv {
                declare local var.n INTEGER;
                set var.n = 5;
                set var.n += 3;
                set var.n *= 2;
                set var.n -= 1;
                set var.n %= 4;
                set var.n |= 8;
                set req.http.X-N = var.n;
                set req.http.X-S = "a";
                set req.http.X-S += "b";
            }
        "#;
        run(source, SubName::Recv, &mut ctx);
        assert_eq!(ctx.req.headers.get("x-n"), Some("11"));
        assert_eq!(ctx.req.headers.get("x-s"), Some("ab"));
    }

    #[test]
    fn test_unknown_function_falls_back() {
        let mut ctx = context("/");
        let source = r#"sub vcl_recv { set req.http.X = std.nope("a"); return(pass); }"#;
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Error);
        assert!(ctx.logs[0].starts_with("vcl_recv: unknown function std.nope"));

        let mut ctx = context("/");
        let source = r#"sub vcl_deliver { std.nope(); }"#;
        assert_eq!(run(source, SubName::Deliver, &mut ctx), Action::Deliver);
    }

    #[test]
    fn test_bad_regex_is_an_eval_error() {
        let mut ctx = context("/");
        let source = r#"sub vcl_recv { if (req.url ~ "(") { return(pass); } }"#;
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Error);
    }

    #[test]
    fn test_error_statement() {
        let mut ctx = context("/");
        let source = r#"sub vcl_recv { error 404 "Not here"; }"#;
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Error);
        assert_eq!(ctx.obj.status, 404);
        assert_eq!(ctx.obj.response, VclString::from("Not here"));
        assert!(ctx.fastly_error);
    }

    #[test]
    fn test_call_propagates_return() {
        let mut ctx = context("/");
        let source = r#"
            sub set_flag { set req.http.X-Flag = "1"; }
            sub bail { return(pass); }
            sub vcl_recv {
                call set_flag;
                call bail;
                set req.http.X-After = "1";
            }
        "#;
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Pass);
        assert_eq!(ctx.req.headers.get("x-flag"), Some("1"));
        assert!(!ctx.req.headers.contains("x-after"));
    }

    #[test]
    fn test_recursive_call_is_bounded() {
        let mut ctx = context("/");
        let source = r#"
            sub again { call again; }
            sub vcl_recv { call again; }
        "#;
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Error);
    }

    #[test]
    fn test_synthetic() {
        let mut ctx = context("/");
        let source = r#"sub vcl_error { synthetic {"<h1>gone</h1>"}; return(deliver); }"#;
        assert_eq!(run(source, SubName::Error, &mut ctx), Action::Deliver);
        assert_eq!(ctx.obj.body, b"<h1>gone</h1>".to_vec());
        assert_eq!(
            ctx.obj.headers.get("content-type"),
            Some("text/html; charset=utf-8")
        );

        let mut ctx = context("/");
        run(r#"sub vcl_error { synthetic.base64 "aGk="; }"#, SubName::Error, &mut ctx);
        assert_eq!(ctx.obj.body, b"hi".to_vec());
    }

    #[test]
    fn test_hash_data_and_ternary() {
        let mut ctx = context("/x");
        let source = r#"
            sub vcl_hash {
                hash_data(req.url);
                set req.http.X-T = if(req.url == "/x", "yes", "no");
                set req.http.X-Q = req.restarts > 0 ? "again" : "first";
            }
        "#;
        assert_eq!(run(source, SubName::Hash, &mut ctx), Action::Hash);
        assert_eq!(ctx.hash_data.len(), 1);
        assert_eq!(ctx.hash_data[0].len(), 64);
        assert_eq!(ctx.req.headers.get("x-t"), Some("yes"));
        assert_eq!(ctx.req.headers.get("x-q"), Some("first"));
    }

    #[test]
    fn test_acl_match() {
        let registry = Registry::new();
        let mut acl = crate::acl::Acl::new("internal");
        acl.add(crate::acl::AclEntry::parse_text("192.168.1.0/24").unwrap());
        registry.add_acl(acl);
        let mut ctx = Context::new(Arc::new(registry), Request::default());
        let source = r#"
            sub vcl_recv {
                if (client.ip ~ internal) { return(pass); }
                if (client.ip !~ internal) { return(lookup); }
            }
        "#;
        ctx.client_ip = "192.168.1.5".into();
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Pass);
        ctx.client_ip = "10.0.0.1".into();
        assert_eq!(run(source, SubName::Recv, &mut ctx), Action::Lookup);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            binary(expr::BinaryOpTy::Plus, &Value::Integer(2), &Value::Integer(3), Fill::Null).unwrap(),
            Value::Integer(5)
        );
        assert_eq!(
            binary(expr::BinaryOpTy::Star, &Value::Float(1.5), &Value::Integer(2), Fill::Null).unwrap(),
            Value::Float(3.0)
        );
        assert!(binary(expr::BinaryOpTy::Slash, &Value::Integer(1), &Value::Integer(0), Fill::Null).is_err());
        assert_eq!(
            binary(expr::BinaryOpTy::Less, &Value::str("10"), &Value::Integer(9), Fill::Null).unwrap(),
            Value::Bool(false)
        );
    }
}
