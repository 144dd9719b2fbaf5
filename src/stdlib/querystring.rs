use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::{compile_regex, Function};
use crate::value::Value;

use super::codec::{percent_decode, percent_encode};
use super::{function, string_arg};

/// Joins names passed to `querystring.filter` and friends.
pub const FILTER_SEPARATOR: &str = "&";

pub fn functions() -> Vec<Function> {
    vec![
        function("querystring.get", 2, 2, get),
        function("querystring.set", 3, 3, set),
        function("querystring.add", 3, 3, add),
        function("querystring.remove", 1, 1, remove),
        function("querystring.clean", 1, 1, clean),
        function("querystring.filter", 2, 2, filter),
        function("querystring.filter_except", 2, 2, filter_except),
        function("querystring.filtersep", 0, 0, filtersep),
        function("querystring.sort", 1, 1, sort),
        function("querystring.regfilter", 2, 2, regfilter),
        function("querystring.regfilter_except", 2, 2, regfilter_except),
    ]
}

struct Url<'a> {
    path: &'a str,
    params: Vec<(String, Option<String>)>,
    fragment: Option<&'a str>,
}

impl<'a> Url<'a> {
    fn parse(url: &'a str) -> Url<'a> {
        let (rest, fragment) = match url.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (url, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (pair.to_string(), None),
            })
            .collect();
        Url {
            path,
            params,
            fragment,
        }
    }

    fn build(&self) -> String {
        let mut out = self.path.to_string();
        if !self.params.is_empty() {
            out.push('?');
            let pairs: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| match v {
                    Some(v) => format!("{}={}", k, v),
                    None => k.clone(),
                })
                .collect();
            out.push_str(&pairs.join("&"));
        }
        if let Some(fragment) = self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

fn get(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let name = string_arg(args, 1);
    let parsed = Url::parse(&url);
    Ok(
        match parsed.params.iter().find(|(k, _)| percent_decode(k) == name) {
            Some((_, Some(v))) => Value::str(percent_decode(v)),
            Some((_, None)) => Value::str(""),
            None => Value::not_set(),
        },
    )
}

fn set(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let name = percent_encode(&string_arg(args, 1));
    let value = percent_encode(&string_arg(args, 2));
    let mut parsed = Url::parse(&url);
    match parsed.params.iter().position(|(k, _)| *k == name) {
        Some(index) => {
            parsed.params[index].1 = Some(value);
            let mut seen = 0;
            parsed.params.retain(|(k, _)| {
                if *k != name {
                    return true;
                }
                seen += 1;
                seen == 1
            });
        }
        None => parsed.params.push((name, Some(value))),
    }
    Ok(Value::str(parsed.build()))
}

fn add(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let mut parsed = Url::parse(&url);
    parsed.params.push((
        percent_encode(&string_arg(args, 1)),
        Some(percent_encode(&string_arg(args, 2))),
    ));
    Ok(Value::str(parsed.build()))
}

fn remove(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let mut parsed = Url::parse(&url);
    parsed.params.clear();
    Ok(Value::str(parsed.build()))
}

/// Drops empty parameters and a dangling `?`.
fn clean(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let mut parsed = Url::parse(&url);
    parsed.params.retain(|(k, _)| !k.is_empty());
    Ok(Value::str(parsed.build()))
}

fn filtersep(_: &mut Context, _: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(FILTER_SEPARATOR))
}

fn listed(args: &[Value]) -> Vec<String> {
    string_arg(args, 1)
        .split(FILTER_SEPARATOR)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn retain_names(args: &[Value], keep_listed: bool) -> Value {
    let url = string_arg(args, 0);
    let names = listed(args);
    let mut parsed = Url::parse(&url);
    parsed
        .params
        .retain(|(k, _)| names.iter().any(|n| *n == percent_decode(k)) == keep_listed);
    Value::str(parsed.build())
}

fn filter(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(retain_names(args, false))
}

fn filter_except(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(retain_names(args, true))
}

fn sort(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let mut parsed = Url::parse(&url);
    parsed.params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Value::str(parsed.build()))
}

fn retain_matching(args: &[Value], keep_matching: bool) -> Result<Value, EvalError> {
    let url = string_arg(args, 0);
    let re = compile_regex(&string_arg(args, 1))?;
    let mut parsed = Url::parse(&url);
    parsed
        .params
        .retain(|(k, _)| re.is_match(&percent_decode(k)) == keep_matching);
    Ok(Value::str(parsed.build()))
}

fn regfilter(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    retain_matching(args, false)
}

fn regfilter_except(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    retain_matching(args, true)
}
