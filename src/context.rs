use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EvalError;
use crate::expr::Type;
use crate::interpreter::Action;
use crate::registry::Registry;
use crate::value::{duration_secs, Value, VclString};

/// Ordered header storage with case-folded names. Repeated names are kept
/// as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every existing value of `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = false;
                self.entries.retain(|(n, _)| {
                    if *n != name {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.len() != before
    }

    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|(n, _)| keep(n));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn separator(name: &str) -> char {
        if name.eq_ignore_ascii_case("cookie") {
            ';'
        } else {
            ','
        }
    }

    /// Reads `key` from a `k=v` list such as `Cookie` or `Cache-Control`.
    pub fn get_subfield(&self, name: &str, key: &str) -> Option<String> {
        let header = self.get(name)?;
        header
            .split(Self::separator(name))
            .map(str::trim)
            .find_map(|item| match item.split_once('=') {
                Some((k, v)) if k.trim() == key => Some(v.trim().trim_matches('"').to_string()),
                None if item == key => Some(String::new()),
                _ => None,
            })
    }

    pub fn set_subfield(&mut self, name: &str, key: &str, value: &str) {
        let separator = Self::separator(name);
        let mut items: Vec<String> = self
            .get(name)
            .map(|h| {
                h.split(separator)
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let field = if value.is_empty() {
            key.to_string()
        } else {
            format!("{}={}", key, value)
        };
        match items.iter().position(|item| subfield_key(item) == key) {
            Some(index) => items[index] = field,
            None => items.push(field),
        }
        self.set(name, items.join(&format!("{} ", separator)));
    }

    pub fn unset_subfield(&mut self, name: &str, key: &str) {
        let separator = Self::separator(name);
        let header = match self.get(name) {
            Some(header) => header.to_string(),
            None => return,
        };
        let items: Vec<&str> = header
            .split(separator)
            .map(str::trim)
            .filter(|item| !item.is_empty() && subfield_key(item) != key)
            .collect();
        if items.is_empty() {
            self.remove(name);
        } else {
            self.set(name, items.join(&format!("{} ", separator)));
        }
    }
}

fn subfield_key(item: &str) -> &str {
    item.split('=').next().unwrap_or("").trim()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            headers: HeaderBag::new(),
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub response: VclString,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            response: VclString::NotSet,
            headers: HeaderBag::new(),
            body: Vec::new(),
        }
    }
}

/// Per-request state every compiled subroutine reads and writes.
#[derive(Debug)]
pub struct Context {
    pub req: Request,
    pub bereq: Request,
    pub beresp: Response,
    pub resp: Response,
    pub obj: Response,

    /// seconds
    pub ttl: i64,
    pub grace: i64,
    pub stale_while_revalidate: i64,
    pub cacheable: bool,

    pub hash_data: Vec<String>,
    pub re_groups: Vec<Option<String>>,
    pub locals: HashMap<String, (Type, Value)>,
    pub current_backend: Option<String>,
    pub backend_name: Option<String>,
    pub restarts: u32,
    pub fastly_error: bool,
    pub pending: Option<Action>,

    pub registry: Arc<Registry>,
    pub client_ip: String,
    pub client_identity: Option<String>,
    pub server_hostname: String,
    pub state: String,
    pub obj_hits: u64,
    pub obj_age: i64,
    pub now: DateTime<Utc>,
    pub esi: bool,
    pub call_depth: usize,
    pub logs: Vec<String>,
}

impl Context {
    pub fn new(registry: Arc<Registry>, req: Request) -> Self {
        Self {
            req,
            bereq: Request::default(),
            beresp: Response::default(),
            resp: Response::default(),
            obj: Response::default(),
            ttl: 0,
            grace: 0,
            stale_while_revalidate: 0,
            cacheable: false,
            hash_data: Vec::new(),
            re_groups: Vec::new(),
            locals: HashMap::new(),
            current_backend: None,
            backend_name: None,
            restarts: 0,
            fastly_error: false,
            pending: None,
            registry,
            client_ip: "127.0.0.1".to_string(),
            client_identity: None,
            server_hostname: "localhost".to_string(),
            state: String::new(),
            obj_hits: 0,
            obj_age: 0,
            now: Utc::now(),
            esi: false,
            call_depth: 0,
            logs: Vec::new(),
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    /// The identity hashed by `client` directors.
    pub fn identity(&self) -> String {
        if let Some(identity) = &self.client_identity {
            return identity.clone();
        }
        self.req
            .headers
            .get("x-client-identity")
            .or_else(|| self.req.headers.get("cookie"))
            .map(str::to_string)
            .unwrap_or_else(|| self.client_ip.clone())
    }

    pub fn headers(&self, scope: &str) -> Option<&HeaderBag> {
        Some(match scope {
            "req" => &self.req.headers,
            "bereq" => &self.bereq.headers,
            "beresp" => &self.beresp.headers,
            "resp" => &self.resp.headers,
            "obj" => &self.obj.headers,
            _ => return None,
        })
    }

    pub fn headers_mut(&mut self, scope: &str) -> Option<&mut HeaderBag> {
        Some(match scope {
            "req" => &mut self.req.headers,
            "bereq" => &mut self.bereq.headers,
            "beresp" => &mut self.beresp.headers,
            "resp" => &mut self.resp.headers,
            "obj" => &mut self.obj.headers,
            _ => return None,
        })
    }

    fn response_mut(&mut self, scope: &str) -> Option<&mut Response> {
        Some(match scope {
            "beresp" => &mut self.beresp,
            "resp" => &mut self.resp,
            "obj" => &mut self.obj,
            _ => return None,
        })
    }

    fn response(&self, scope: &str) -> Option<&Response> {
        Some(match scope {
            "beresp" => &self.beresp,
            "resp" => &self.resp,
            "obj" => &self.obj,
            _ => return None,
        })
    }

    fn request(&self, scope: &str) -> Option<&Request> {
        Some(match scope {
            "req" => &self.req,
            "bereq" => &self.bereq,
            _ => return None,
        })
    }

    fn request_mut(&mut self, scope: &str) -> Option<&mut Request> {
        Some(match scope {
            "req" => &mut self.req,
            "bereq" => &mut self.bereq,
            _ => return None,
        })
    }

    pub fn declare(&mut self, name: &str, ty: Type) {
        self.locals.insert(name.to_string(), (ty, default_for(ty)));
    }

    /// Resolves a dotted identifier. Unknown dotted paths read as unset;
    /// bare words name themselves.
    pub fn get_var(&self, name: &str) -> Value {
        if let Some((scope, header, sub)) = split_header_path(name) {
            let headers = match self.headers(scope) {
                Some(headers) => headers,
                None => return Value::not_set(),
            };
            return match sub {
                Some(key) => VclString::from(headers.get_subfield(header, key)).into(),
                None => VclString::from(headers.get(header).map(str::to_string)).into(),
            };
        }

        if let Some(n) = name.strip_prefix("re.group.") {
            return match n.parse::<usize>().ok().and_then(|n| self.re_groups.get(n)) {
                Some(Some(group)) => Value::str(group.clone()),
                _ => Value::not_set(),
            };
        }

        if let Some((backend, field)) = name
            .strip_prefix("backend.")
            .and_then(|rest| rest.rsplit_once('.'))
        {
            return match field {
                "healthy" => Value::Bool(self.registry.is_healthy(backend)),
                _ => Value::not_set(),
            };
        }

        if name.starts_with("var.") {
            return match self.locals.get(name) {
                Some((_, value)) => value.clone(),
                None => Value::not_set(),
            };
        }

        match name {
            "req.backend" => VclString::from(self.current_backend.clone()).into(),
            "req.backend.healthy" => Value::Bool(match &self.current_backend {
                Some(name) if self.registry.has_director(name) => self
                    .registry
                    .select_backend(name, &self.hash_data, &self.identity())
                    .is_some(),
                Some(name) => self.registry.is_healthy(name),
                None => false,
            }),
            "req.restarts" => Value::Integer(i64::from(self.restarts)),
            "req.url.path" => Value::str(url_path(&self.req.url)),
            "req.url.qs" => Value::str(url_query(&self.req.url)),
            "req.url.basename" => Value::str(url_basename(&self.req.url)),
            "req.url.dirname" => Value::str(url_dirname(&self.req.url)),
            "req.url.ext" => Value::str(url_ext(&self.req.url)),
            "req.hash" | "req.digest" => Value::str(self.hash_data.join(":")),
            "req.esi" => Value::Bool(self.esi),
            "beresp.ttl" | "obj.ttl" => Value::Integer(self.ttl),
            "beresp.grace" | "obj.grace" => Value::Integer(self.grace),
            "beresp.stale_while_revalidate" | "obj.stale_while_revalidate" => {
                Value::Integer(self.stale_while_revalidate)
            }
            "beresp.cacheable" => Value::Bool(self.cacheable),
            "beresp.backend.name" => VclString::from(self.backend_name.clone()).into(),
            "obj.hits" => Value::Integer(self.obj_hits as i64),
            "obj.age" => Value::Integer(self.obj_age),
            "client.ip" => Value::str(self.client_ip.clone()),
            "client.identity" => Value::str(self.identity()),
            "server.hostname" | "server.identity" => Value::str(self.server_hostname.clone()),
            "now" => Value::Time(self.now),
            "now.sec" => Value::str(self.now.timestamp().to_string()),
            "fastly_info.state" => Value::str(self.state.clone()),
            "fastly.error" => Value::Bool(self.fastly_error),
            _ => self.get_field(name),
        }
    }

    fn get_field(&self, name: &str) -> Value {
        let (scope, field) = match name.split_once('.') {
            Some(parts) => parts,
            None => return Value::str(name),
        };
        if let Some(req) = self.request(scope) {
            return match field {
                "url" => Value::str(req.url.clone()),
                "method" | "request" => Value::str(req.method.clone()),
                "proto" => Value::str(req.proto.clone()),
                "body" => Value::str(String::from_utf8_lossy(&req.body).into_owned()),
                _ => Value::not_set(),
            };
        }
        if let Some(resp) = self.response(scope) {
            return match field {
                "status" => Value::Integer(i64::from(resp.status)),
                "response" => resp.response.clone().into(),
                "proto" => Value::str("HTTP/1.1"),
                "body" => Value::str(String::from_utf8_lossy(&resp.body).into_owned()),
                _ => Value::not_set(),
            };
        }
        Value::not_set()
    }

    /// Writes a dotted target. Unknown targets are ignored.
    pub fn set_var(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        if let Some((scope, header, sub)) = split_header_path(name) {
            let (header, sub) = (header.to_string(), sub.map(str::to_string));
            let headers = match self.headers_mut(scope) {
                Some(headers) => headers,
                None => return Ok(()),
            };
            match (value.to_vcl_string().into_option(), sub) {
                (Some(text), Some(key)) => headers.set_subfield(&header, &key, &text),
                (None, Some(key)) => headers.unset_subfield(&header, &key),
                (Some(text), None) => headers.set(&header, text),
                (None, None) => {
                    headers.remove(&header);
                }
            }
            return Ok(());
        }

        if name.starts_with("var.") {
            return match self.locals.get(name).map(|(ty, _)| *ty) {
                Some(ty) => {
                    let coerced = coerce(ty, value)?;
                    self.locals.insert(name.to_string(), (ty, coerced));
                    Ok(())
                }
                None => {
                    self.log(format!("assignment to undeclared variable {}", name));
                    Ok(())
                }
            };
        }

        match name {
            "req.backend" => {
                self.current_backend = value.to_vcl_string().into_option();
                return Ok(());
            }
            "beresp.ttl" | "obj.ttl" => {
                self.ttl = duration_secs(&value);
                return Ok(());
            }
            "beresp.grace" | "obj.grace" => {
                self.grace = duration_secs(&value);
                return Ok(());
            }
            "beresp.stale_while_revalidate" | "obj.stale_while_revalidate" => {
                self.stale_while_revalidate = duration_secs(&value);
                return Ok(());
            }
            "beresp.cacheable" => {
                self.cacheable = value.is_truthy();
                return Ok(());
            }
            "client.identity" => {
                self.client_identity = value.to_vcl_string().into_option();
                return Ok(());
            }
            "req.esi" | "beresp.do_esi" => {
                self.esi = value.is_truthy();
                return Ok(());
            }
            _ => {}
        }

        let (scope, field) = match name.split_once('.') {
            Some(parts) => parts,
            None => return Ok(()),
        };
        if let Some(req) = self.request_mut(scope) {
            match field {
                "url" => req.url = value.to_plain_string(),
                "method" | "request" => req.method = value.to_plain_string(),
                "proto" => req.proto = value.to_plain_string(),
                "body" => req.body = value.to_plain_string().into_bytes(),
                _ => {}
            }
            return Ok(());
        }
        if let Some(resp) = self.response_mut(scope) {
            match field {
                "status" => {
                    resp.status = match value.to_i64() {
                        Some(status) if (100..=999).contains(&status) => status as u16,
                        _ => {
                            return Err(EvalError::Coercion {
                                value: value.to_string(),
                                to: "status",
                            })
                        }
                    }
                }
                "response" => resp.response = value.to_vcl_string(),
                "body" => resp.body = value.to_plain_string().into_bytes(),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn unset_var(&mut self, name: &str) {
        if let Some((scope, header, sub)) = split_header_path(name) {
            let (header, sub) = (header.to_string(), sub.map(str::to_string));
            if let Some(headers) = self.headers_mut(scope) {
                match sub {
                    Some(key) => headers.unset_subfield(&header, &key),
                    None => {
                        headers.remove(&header);
                    }
                }
            }
            return;
        }
        if let Some((ty, value)) = self.locals.get_mut(name) {
            *value = default_for(*ty);
            return;
        }
        match name {
            "req.backend" => self.current_backend = None,
            "client.identity" => self.client_identity = None,
            "obj.response" => self.obj.response = VclString::NotSet,
            "resp.response" => self.resp.response = VclString::NotSet,
            "beresp.response" => self.beresp.response = VclString::NotSet,
            _ => {}
        }
    }

    /// `add scope.http.Name = value` appends a header instead of replacing it.
    pub fn add_header(&mut self, name: &str, value: Value) {
        if let Some((scope, header, None)) = split_header_path(name) {
            let header = header.to_string();
            if let (Some(text), Some(headers)) =
                (value.to_vcl_string().into_option(), self.headers_mut(scope))
            {
                headers.add(&header, text);
            }
        }
    }
}

/// `req.http.Cookie:id` → `("req", "Cookie", Some("id"))`
pub fn split_header_path(name: &str) -> Option<(&str, &str, Option<&str>)> {
    let (scope, rest) = name.split_once(".http.")?;
    if scope.contains('.') || rest.is_empty() {
        return None;
    }
    Some(match rest.split_once(':') {
        Some((header, sub)) => (scope, header, Some(sub)),
        None => (scope, rest, None),
    })
}

pub fn default_for(ty: Type) -> Value {
    match ty {
        Type::Integer => Value::Integer(0),
        Type::Float | Type::Rtime => Value::Float(0.0),
        Type::Bool => Value::Bool(false),
        Type::Time => Value::Time(Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)),
        _ => Value::not_set(),
    }
}

pub fn coerce(ty: Type, value: Value) -> Result<Value, EvalError> {
    let fail = |value: &Value, to: &'static str| EvalError::Coercion {
        value: value.to_string(),
        to,
    };
    Ok(match ty {
        Type::Integer => match value.to_i64() {
            Some(n) => Value::Integer(n),
            None => return Err(fail(&value, "INTEGER")),
        },
        Type::Float => match value.to_f64() {
            Some(n) => Value::Float(n),
            None => return Err(fail(&value, "FLOAT")),
        },
        Type::Rtime => Value::Float(duration_secs(&value) as f64),
        Type::Bool => Value::Bool(value.is_truthy()),
        Type::Time => match value.to_time() {
            Some(t) => Value::Time(t),
            None => return Err(fail(&value, "TIME")),
        },
        _ => Value::String(value.to_vcl_string()),
    })
}

fn url_path(url: &str) -> &str {
    url.split(|c| c == '?' || c == '#').next().unwrap_or("")
}

fn url_query(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or("");
    match without_fragment.split_once('?') {
        Some((_, qs)) => qs,
        None => "",
    }
}

fn url_basename(url: &str) -> &str {
    let path = url_path(url);
    path.rsplit('/').next().unwrap_or("")
}

fn url_dirname(url: &str) -> &str {
    let path = url_path(url);
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => ".",
    }
}

fn url_ext(url: &str) -> &str {
    let basename = url_basename(url);
    match basename.rfind('.') {
        Some(index) => &basename[index + 1..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        let req = Request {
            url: "/a/b/file.tar.gz?x=1&y=2".to_string(),
            ..Request::default()
        };
        Context::new(Arc::new(Registry::new()), req)
    }

    #[test]
    fn test_header_round_trip() {
        let mut ctx = context();
        ctx.set_var("req.http.X-Test", Value::str("v")).unwrap();
        assert_eq!(ctx.get_var("req.http.x-test"), Value::str("v"));
        assert_eq!(ctx.get_var("req.http.X-TEST"), Value::str("v"));
        assert_eq!(ctx.get_var("req.http.Missing"), Value::not_set());

        ctx.set_var("req.http.X-Test", Value::not_set()).unwrap();
        assert!(!ctx.req.headers.contains("x-test"));
    }

    #[test]
    fn test_cookie_subfields() {
        let mut ctx = context();
        ctx.req.headers.set("Cookie", "a=1; session=abc");
        assert_eq!(ctx.get_var("req.http.Cookie:session"), Value::str("abc"));
        ctx.set_var("req.http.Cookie:a", Value::str("2")).unwrap();
        assert_eq!(ctx.req.headers.get("cookie"), Some("a=2; session=abc"));
        ctx.unset_var("req.http.Cookie:a");
        assert_eq!(ctx.req.headers.get("cookie"), Some("session=abc"));
        ctx.unset_var("req.http.Cookie:session");
        assert!(!ctx.req.headers.contains("cookie"));
    }

    #[test]
    fn test_url_parts() {
        let ctx = context();
        assert_eq!(ctx.get_var("req.url.path"), Value::str("/a/b/file.tar.gz"));
        assert_eq!(ctx.get_var("req.url.qs"), Value::str("x=1&y=2"));
        assert_eq!(ctx.get_var("req.url.basename"), Value::str("file.tar.gz"));
        assert_eq!(ctx.get_var("req.url.dirname"), Value::str("/a/b"));
        assert_eq!(ctx.get_var("req.url.ext"), Value::str("gz"));
    }

    #[test]
    fn test_durations_and_unknown_targets() {
        let mut ctx = context();
        ctx.set_var("beresp.ttl", Value::str("5m")).unwrap();
        assert_eq!(ctx.ttl, 300);
        ctx.set_var("beresp.grace", Value::Integer(30)).unwrap();
        assert_eq!(ctx.get_var("beresp.grace"), Value::Integer(30));
        ctx.set_var("beresp.nonsense", Value::str("x")).unwrap();
        ctx.set_var("nothing.here.at.all", Value::str("x")).unwrap();
        assert_eq!(ctx.get_var("beresp.nonsense"), Value::not_set());
        assert_eq!(ctx.get_var("req"), Value::str("req"));
    }

    #[test]
    fn test_locals() {
        let mut ctx = context();
        ctx.declare("var.n", Type::Integer);
        ctx.declare("var.s", Type::String);
        assert_eq!(ctx.get_var("var.n"), Value::Integer(0));
        assert_eq!(ctx.get_var("var.s"), Value::not_set());
        ctx.set_var("var.n", Value::str("42")).unwrap();
        assert_eq!(ctx.get_var("var.n"), Value::Integer(42));
        assert!(ctx.set_var("var.n", Value::str("abc")).is_err());

        ctx.set_var("var.undeclared", Value::str("x")).unwrap();
        assert_eq!(ctx.get_var("var.undeclared"), Value::not_set());
        assert_eq!(ctx.logs.len(), 1);
    }

    #[test]
    fn test_status_and_response() {
        let mut ctx = context();
        ctx.set_var("obj.status", Value::Integer(404)).unwrap();
        ctx.set_var("obj.response", Value::str("Not Found")).unwrap();
        assert_eq!(ctx.obj.status, 404);
        assert_eq!(ctx.get_var("obj.response"), Value::str("Not Found"));
        assert!(ctx.set_var("resp.status", Value::str("nope")).is_err());
    }

    #[test]
    fn test_identity() {
        let mut ctx = context();
        assert_eq!(ctx.identity(), "127.0.0.1");
        ctx.req.headers.set("Cookie", "id=7");
        assert_eq!(ctx.identity(), "id=7");
        ctx.req.headers.set("X-Client-Identity", "user-1");
        assert_eq!(ctx.identity(), "user-1");
    }

    #[test]
    fn test_header_bag_set_replaces_all() {
        let mut headers = HeaderBag::new();
        headers.add("Vary", "a");
        headers.add("vary", "b");
        assert_eq!(headers.get_all("vary"), vec!["a", "b"]);
        headers.set("VARY", "c");
        assert_eq!(headers.get_all("vary"), vec!["c"]);
    }
}
