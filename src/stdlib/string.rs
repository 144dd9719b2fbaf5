use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::{compile_regex, Function};
use crate::value::{Value, VclString};

use super::{function, int_arg, string_arg, vcl_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("std.tolower", 1, 1, tolower),
        function("std.toupper", 1, 1, toupper),
        function("std.strlen", 1, 1, strlen),
        function("std.prefixof", 2, 2, prefixof),
        function("std.suffixof", 2, 2, suffixof),
        function("std.strstr", 2, 2, strstr),
        function("std.replace", 3, 3, replace),
        function("std.replaceall", 3, 3, replaceall),
        function("std.replace_prefix", 3, 3, replace_prefix),
        function("std.replace_suffix", 3, 3, replace_suffix),
        function("std.strrev", 1, 1, strrev),
        function("std.strrep", 2, 2, strrep),
        function("std.atoi", 1, 1, atoi),
        function("std.atof", 1, 1, atof),
        function("std.itoa", 1, 2, itoa),
        function("std.strtol", 2, 2, strtol),
        function("substr", 2, 3, substr),
        function("regsub", 3, 3, regsub),
        function("regsuball", 3, 3, regsuball),
    ]
}

fn tolower(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(map_set(vcl_arg(args, 0), |s| s.to_lowercase()))
}

fn toupper(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(map_set(vcl_arg(args, 0), |s| s.to_uppercase()))
}

fn map_set(s: VclString, f: impl Fn(&str) -> String) -> Value {
    match s {
        VclString::NotSet => Value::not_set(),
        other => Value::str(f(other.as_str())),
    }
}

fn strlen(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Integer(string_arg(args, 0).chars().count() as i64))
}

fn prefixof(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(string_arg(args, 0).starts_with(&string_arg(args, 1))))
}

fn suffixof(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(string_arg(args, 0).ends_with(&string_arg(args, 1))))
}

/// The remainder of the haystack from the first occurrence of the needle.
fn strstr(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let haystack = string_arg(args, 0);
    let needle = string_arg(args, 1);
    Ok(match haystack.find(&needle) {
        Some(index) => Value::str(&haystack[index..]),
        None => Value::not_set(),
    })
}

fn replace(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let target = string_arg(args, 1);
    let s = string_arg(args, 0);
    if target.is_empty() {
        return Ok(Value::str(s));
    }
    Ok(Value::str(s.replacen(&target, &string_arg(args, 2), 1)))
}

fn replaceall(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let target = string_arg(args, 1);
    let s = string_arg(args, 0);
    if target.is_empty() {
        return Ok(Value::str(s));
    }
    Ok(Value::str(s.replace(&target, &string_arg(args, 2))))
}

fn replace_prefix(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let s = string_arg(args, 0);
    Ok(Value::str(match s.strip_prefix(&string_arg(args, 1)) {
        Some(rest) => format!("{}{}", string_arg(args, 2), rest),
        None => s,
    }))
}

fn replace_suffix(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let s = string_arg(args, 0);
    Ok(Value::str(match s.strip_suffix(&string_arg(args, 1)) {
        Some(rest) => format!("{}{}", rest, string_arg(args, 2)),
        None => s,
    }))
}

fn strrev(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(string_arg(args, 0).chars().rev().collect::<String>()))
}

fn strrep(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let count = int_arg(args, 1, 0).clamp(0, 10_000) as usize;
    Ok(Value::str(string_arg(args, 0).repeat(count)))
}

/// Parses the leading integer of a string, like C's `atoi`.
fn atoi(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let s = string_arg(args, 0);
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    Ok(Value::Integer(s[..end].parse().unwrap_or(0)))
}

fn atof(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let s = string_arg(args, 0);
    let s = s.trim_start();
    let mut end = 0;
    for i in (1..=s.len()).rev() {
        if s.is_char_boundary(i) && s[..i].parse::<f64>().is_ok() {
            end = i;
            break;
        }
    }
    Ok(Value::Float(s[..end].parse().unwrap_or(0.0)))
}

fn itoa(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let n = int_arg(args, 0, 0);
    let base = int_arg(args, 1, 10);
    Ok(match to_radix(n, base as u32) {
        Some(s) => Value::str(s),
        None => Value::not_set(),
    })
}

fn to_radix(n: i64, base: u32) -> Option<String> {
    if !(2..=36).contains(&base) {
        return None;
    }
    if n == 0 {
        return Some("0".to_string());
    }
    let mut digits = Vec::new();
    let mut rest = n.unsigned_abs();
    while rest > 0 {
        digits.push(std::char::from_digit((rest % u64::from(base)) as u32, base)?);
        rest /= u64::from(base);
    }
    if n < 0 {
        digits.push('-');
    }
    Some(digits.iter().rev().collect())
}

/// `base` 0 detects `0x` and leading-zero octal prefixes.
fn strtol(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let s = string_arg(args, 0);
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (base, digits) = match int_arg(args, 1, 10) {
        0 if digits.starts_with("0x") || digits.starts_with("0X") => (16, &digits[2..]),
        0 if digits.len() > 1 && digits.starts_with('0') => (8, &digits[1..]),
        0 => (10, digits),
        16 => (16, digits.trim_start_matches("0x").trim_start_matches("0X")),
        base if (2..=36).contains(&base) => (base as u32, digits),
        _ => return Ok(Value::Integer(0)),
    };
    let n = i64::from_str_radix(digits, base).unwrap_or(0);
    Ok(Value::Integer(if negative { -n } else { n }))
}

/// Character-based; a negative offset counts from the end. Out of range
/// reads as unset.
fn substr(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let chars: Vec<char> = string_arg(args, 0).chars().collect();
    let len = chars.len() as i64;
    let mut offset = int_arg(args, 1, 0);
    if offset < 0 {
        offset += len;
    }
    if offset < 0 || offset > len {
        return Ok(Value::not_set());
    }
    let end = match args.get(2) {
        Some(_) => {
            let length = int_arg(args, 2, 0);
            if length < 0 {
                len + length
            } else {
                (offset + length).min(len)
            }
        }
        None => len,
    };
    if end < offset {
        return Ok(Value::not_set());
    }
    Ok(Value::str(
        chars[offset as usize..end as usize].iter().collect::<String>(),
    ))
}

/// `\1` style references become `${1}` for the regex crate.
fn replacement(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some(d) if d.is_ascii_digit() => {
                    out.push_str(&format!("${{{}}}", d));
                    chars.next();
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            },
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}

fn regsub(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    substitute(ctx, args, false)
}

fn regsuball(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    substitute(ctx, args, true)
}

fn substitute(_: &mut Context, args: &[Value], all: bool) -> Result<Value, EvalError> {
    let input = string_arg(args, 0);
    let re = compile_regex(&string_arg(args, 1))?;
    let template = replacement(&string_arg(args, 2));
    let out = if all {
        re.replace_all(&input, template.as_str())
    } else {
        re.replacen(&input, 1, template.as_str())
    };
    Ok(Value::str(out.into_owned()))
}
