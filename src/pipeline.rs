//! Drives one client request through the VCL lifecycle:
//! recv, hash, lookup, hit/miss/pass, fetch, deliver, error and log.

use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::{CacheEntry, CacheStore, CachedResponse, Clock, Lookup, SystemClock};
use crate::config::{Route, Settings};
use crate::context::{Context, HeaderBag, Request, Response};
use crate::error::{BackendError, PipelineError};
use crate::interpreter::{raise_error, Action, CompiledProgram, SubName};
use crate::registry::{Backend, Registry};
use crate::value::VclString;

/// What an origin sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
}

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send>>;

/// Sends a backend request. Implemented over HTTP by `client::HttpClient`.
pub trait Fetch: Send + Sync {
    fn fetch(&self, backend: Arc<Backend>, request: Request) -> FetchFuture;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
    pub client_ip: String,
}

impl Default for IncomingRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            headers: HeaderBag::new(),
            body: Vec::new(),
            client_ip: "127.0.0.1".to_string(),
        }
    }
}

impl IncomingRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub response: OutgoingResponse,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_restarts: u32,
    pub backend_timeout: Duration,
    pub default_ttl: i64,
    pub fallback_director: Option<String>,
    pub routes: Vec<Route>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings::from(&Settings::default())
    }
}

impl From<&Settings> for PipelineSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            backend_timeout: settings.backend_timeout,
            default_ttl: settings.default_ttl,
            fallback_director: settings.fallback_director.clone(),
            routes: settings.routes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    HitStale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::HitStale => "HIT-STALE",
            CacheStatus::Miss => "MISS",
        }
    }
}

enum Stage {
    Recv,
    Hash,
    Lookup(String),
    Hit { entry: Arc<CacheEntry>, stale: bool },
    Miss(String),
    Pass,
    Fetch(Option<String>),
    Deliver(CacheStatus),
    Error,
    Restart,
    Done(OutgoingResponse),
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderBag) {
    let listed: Vec<String> = headers
        .get_all("connection")
        .iter()
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    headers.retain(|name| !HOP_BY_HOP.contains(&name) && !listed.iter().any(|l| l == name));
}

pub fn is_cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 203 | 300 | 301 | 302 | 404 | 410)
}

fn is_cacheable_method(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}

fn directives(value: &str) -> Vec<(String, Option<String>)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.split_once('=') {
            Some((k, v)) => (
                k.trim().to_ascii_lowercase(),
                Some(v.trim().trim_matches('"').to_string()),
            ),
            None => (d.to_ascii_lowercase(), None),
        })
        .collect()
}

fn seconds(directives: &[(String, Option<String>)], name: &str) -> Option<i64> {
    directives
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| v.as_deref())
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.max(0))
}

/// Initial `(ttl, stale_while_revalidate)` for a backend response.
/// `Surrogate-Control` beats `Cache-Control`; within `Cache-Control`,
/// `s-maxage` beats `max-age`.
pub fn freshness(headers: &HeaderBag, default_ttl: i64) -> (i64, i64) {
    let surrogate = headers
        .get("surrogate-control")
        .map(directives)
        .unwrap_or_default();
    let cache_control = directives(&headers.get_all("cache-control").join(","));

    let swr = seconds(&surrogate, "stale-while-revalidate")
        .or_else(|| seconds(&cache_control, "stale-while-revalidate"))
        .unwrap_or(0);

    if let Some(ttl) = seconds(&surrogate, "max-age") {
        return (ttl, swr);
    }
    if cache_control
        .iter()
        .any(|(k, _)| k == "private" || k == "no-store" || k == "no-cache")
    {
        return (0, 0);
    }
    let ttl = seconds(&cache_control, "s-maxage")
        .or_else(|| seconds(&cache_control, "max-age"))
        .unwrap_or(default_ttl);
    (ttl, swr)
}

pub fn reason_phrase(status: u16) -> &'static str {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

pub fn default_error_page(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body><h1>{status} {reason}</h1></body>\n</html>\n",
        status = status,
        reason = reason
    )
    .into_bytes()
}

fn cached_to_response(cached: &CachedResponse) -> Response {
    Response {
        status: cached.status,
        response: VclString::from(cached.reason.clone()),
        headers: cached.headers.clone(),
        body: cached.body.clone(),
    }
}

/// Resolves once any receiver observes `true`. A closed channel never fires.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct Pipeline {
    program: Arc<CompiledProgram>,
    registry: Arc<Registry>,
    fetcher: Arc<dyn Fetch>,
    cache: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    routes: Vec<(Regex, String)>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(
        program: Arc<CompiledProgram>,
        registry: Arc<Registry>,
        fetcher: Arc<dyn Fetch>,
        settings: PipelineSettings,
    ) -> Self {
        let routes = settings
            .routes
            .iter()
            .filter_map(|route| match Regex::new(&route.pattern) {
                Ok(re) => Some((re, route.backend.clone())),
                Err(err) => {
                    eprintln!("ignoring route {:?}: {}", route.pattern, err);
                    None
                }
            })
            .collect();
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            program,
            registry,
            fetcher,
            cache: Arc::new(CacheStore::new()),
            clock: Arc::new(SystemClock),
            settings,
            routes,
            shutdown,
            shutdown_rx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A receiver that flips to `true` when `shutdown` is called.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Cancels in-flight backend requests; later ones fail immediately.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn handle(&self, incoming: IncomingRequest) -> Outcome {
        let request = Request {
            method: incoming.method.to_ascii_uppercase(),
            url: incoming.url,
            proto: incoming.proto,
            headers: incoming.headers,
            body: incoming.body,
        };
        let mut ctx = Context::new(Arc::clone(&self.registry), request);
        ctx.client_ip = incoming.client_ip;
        ctx.now = self.clock.now();

        let mut handled_error = false;
        let mut stage = Stage::Recv;
        let response = loop {
            stage = match stage {
                Stage::Recv => {
                    ctx.state = "RECV".to_string();
                    match self.program.run(SubName::Recv, &mut ctx) {
                        Action::Pass | Action::Pipe => Stage::Pass,
                        Action::Error => Stage::Error,
                        Action::Restart => Stage::Restart,
                        _ => Stage::Hash,
                    }
                }
                Stage::Hash => {
                    ctx.hash_data.clear();
                    match self.program.run(SubName::Hash, &mut ctx) {
                        Action::Error => Stage::Error,
                        Action::Restart => Stage::Restart,
                        _ => Stage::Lookup(cache_key(&ctx)),
                    }
                }
                Stage::Lookup(key) => {
                    if !is_cacheable_method(&ctx.req.method) {
                        Stage::Miss(key)
                    } else {
                        match self.cache.lookup(&key, ctx.now) {
                            Lookup::Fresh(entry) => Stage::Hit {
                                entry,
                                stale: false,
                            },
                            Lookup::Stale(entry) => Stage::Hit { entry, stale: true },
                            Lookup::Miss => Stage::Miss(key),
                        }
                    }
                }
                Stage::Hit { entry, stale } => self.hit(&mut ctx, entry, stale),
                Stage::Miss(key) => {
                    ctx.state = "MISS".to_string();
                    ctx.bereq = ctx.req.clone();
                    match self.program.run(SubName::Miss, &mut ctx) {
                        Action::Error => Stage::Error,
                        Action::Restart => Stage::Restart,
                        Action::Pass => Stage::Fetch(None),
                        _ => Stage::Fetch(Some(key)),
                    }
                }
                Stage::Pass => {
                    ctx.state = "PASS".to_string();
                    ctx.bereq = ctx.req.clone();
                    match self.program.run(SubName::Pass, &mut ctx) {
                        Action::Error => Stage::Error,
                        Action::Restart => Stage::Restart,
                        _ => Stage::Fetch(None),
                    }
                }
                Stage::Fetch(key) => self.fetch(&mut ctx, key).await,
                Stage::Deliver(status) => {
                    let headers = &mut ctx.resp.headers;
                    headers.set("x-cache", status.as_str());
                    headers.set("x-cache-hits", ctx.obj_hits.to_string());
                    headers.set("x-cache-age", ctx.obj_age.to_string());
                    if let Some(backend) = &ctx.backend_name {
                        headers.set("x-backend", backend.as_str());
                    }
                    match self.program.run(SubName::Deliver, &mut ctx) {
                        Action::Restart => Stage::Restart,
                        Action::Error if !handled_error => Stage::Error,
                        _ => Stage::Done(outgoing(&ctx)),
                    }
                }
                Stage::Error => {
                    handled_error = true;
                    ctx.state = "ERROR".to_string();
                    if !ctx.fastly_error {
                        raise_error(&mut ctx, 503, VclString::NotSet);
                    }
                    match self.program.run(SubName::Error, &mut ctx) {
                        Action::Restart => Stage::Restart,
                        _ => {
                            finish_error_object(&mut ctx);
                            ctx.resp = ctx.obj.clone();
                            ctx.obj_hits = 0;
                            ctx.obj_age = 0;
                            Stage::Deliver(CacheStatus::Miss)
                        }
                    }
                }
                Stage::Restart => {
                    if ctx.restarts >= self.settings.max_restarts {
                        let err = PipelineError::RestartLimitExceeded(self.settings.max_restarts);
                        eprintln!("{}: {}", ctx.req.url, err);
                        ctx.log(err.to_string());
                        Stage::Done(fatal(err.status()))
                    } else {
                        ctx.restarts += 1;
                        reset_for_restart(&mut ctx);
                        handled_error = false;
                        Stage::Recv
                    }
                }
                Stage::Done(response) => break response,
            }
        };

        ctx.resp = Response {
            status: response.status,
            response: VclString::from(response.reason.clone()),
            headers: response.headers.clone(),
            body: response.body.clone(),
        };
        ctx.state = "LOG".to_string();
        self.program.run(SubName::Log, &mut ctx);

        Outcome {
            response,
            logs: std::mem::take(&mut ctx.logs),
        }
    }

    fn hit(&self, ctx: &mut Context, entry: Arc<CacheEntry>, stale: bool) -> Stage {
        ctx.state = if stale { "HIT-STALE" } else { "HIT" }.to_string();
        ctx.obj = cached_to_response(&entry.response);
        ctx.obj_hits = entry.record_hit();
        ctx.obj_age = entry.age(ctx.now);
        match self.program.run(SubName::Hit, ctx) {
            Action::Deliver | Action::DeliverStale => {
                if stale {
                    self.revalidate(entry);
                }
                ctx.resp = ctx.obj.clone();
                Stage::Deliver(if stale {
                    CacheStatus::HitStale
                } else {
                    CacheStatus::Hit
                })
            }
            Action::Pass => Stage::Pass,
            Action::Error => Stage::Error,
            Action::Restart => Stage::Restart,
            _ => {
                ctx.obj_hits = 0;
                ctx.obj_age = 0;
                Stage::Miss(entry.key.clone())
            }
        }
    }

    /// Evicts a stale entry off the response path. A newer entry stored
    /// under the same key is left alone.
    fn revalidate(&self, entry: Arc<CacheEntry>) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            cache.remove_if_same(&entry);
        });
    }

    /// `req.backend` first, then the first matching route, then the first
    /// declared backend.
    fn backend_for(&self, ctx: &Context) -> Option<String> {
        if let Some(name) = &ctx.current_backend {
            return Some(name.clone());
        }
        if let Some((_, backend)) = self.routes.iter().find(|(re, _)| re.is_match(&ctx.req.url)) {
            return Some(backend.clone());
        }
        self.registry
            .backends()
            .first()
            .map(|backend| backend.name.clone())
    }

    async fn attempt(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<(Arc<Backend>, BackendResponse), BackendError> {
        let backend = self
            .registry
            .resolve(name, &ctx.hash_data, &ctx.identity())?;
        let response = self.send(Arc::clone(&backend), ctx.bereq.clone()).await?;
        Ok((backend, response))
    }

    async fn send(
        &self,
        backend: Arc<Backend>,
        request: Request,
    ) -> Result<BackendResponse, BackendError> {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow() {
            return Err(BackendError::Cancelled);
        }
        let name = backend.name.clone();
        let request = self.fetcher.fetch(backend, request);
        tokio::select! {
            result = tokio::time::timeout(self.settings.backend_timeout, request) => match result {
                Ok(response) => response,
                Err(_) => Err(BackendError::Timeout(name)),
            },
            _ = cancelled(&mut shutdown) => Err(BackendError::Cancelled),
        }
    }

    async fn fetch(&self, ctx: &mut Context, key: Option<String>) -> Stage {
        let name = match self.backend_for(ctx) {
            Some(name) => name,
            None => return backend_failed(ctx, BackendError::NoBackend),
        };

        let mut result = self.attempt(ctx, &name).await;
        let failed = match &result {
            Ok((_, response)) => response.status >= 500,
            Err(_) => true,
        };
        if failed {
            if let Some(fallback) = self
                .settings
                .fallback_director
                .as_deref()
                .filter(|fallback| *fallback != name)
            {
                ctx.log(format!("{}: retrying via {}", name, fallback));
                match self.attempt(ctx, fallback).await {
                    Ok(retried) => result = Ok(retried),
                    Err(err) => eprintln!("{}: fallback {} failed: {}", name, fallback, err),
                }
            }
        }

        let (backend, response) = match result {
            Ok(fetched) => fetched,
            Err(err) => return backend_failed(ctx, err),
        };

        let (ttl, swr) = freshness(&response.headers, self.settings.default_ttl);
        ctx.backend_name = Some(backend.name.clone());
        ctx.cacheable = is_cacheable_status(response.status);
        ctx.ttl = ttl;
        ctx.grace = 0;
        ctx.stale_while_revalidate = swr;
        ctx.beresp = Response {
            status: response.status,
            response: VclString::from(response.reason),
            headers: response.headers,
            body: response.body,
        };

        match self.program.run(SubName::Fetch, ctx) {
            Action::Error => Stage::Error,
            Action::Restart => Stage::Restart,
            action => {
                let deliverable = matches!(action, Action::Deliver | Action::DeliverStale);
                if let Some(key) = key {
                    if deliverable
                        && is_cacheable_method(&ctx.req.method)
                        && ctx.cacheable
                        && ctx.ttl > 0
                    {
                        self.store(ctx, key);
                    }
                }
                ctx.resp = ctx.beresp.clone();
                ctx.obj_hits = 0;
                ctx.obj_age = 0;
                Stage::Deliver(CacheStatus::Miss)
            }
        }
    }

    fn store(&self, ctx: &Context, key: String) {
        let beresp = &ctx.beresp;
        let reason = match &beresp.response {
            VclString::NotSet => reason_phrase(beresp.status).to_string(),
            other => other.as_str().to_string(),
        };
        let mut headers = beresp.headers.clone();
        strip_hop_by_hop(&mut headers);
        let response = CachedResponse {
            status: beresp.status,
            reason,
            headers,
            body: beresp.body.clone(),
        };
        self.cache.insert(CacheEntry::new(
            key,
            response,
            ctx.now,
            ctx.ttl,
            ctx.grace,
            ctx.stale_while_revalidate,
        ));
    }
}

/// `hash_data` joined by `:`, or `<url>:<host>` when `vcl_hash` added nothing.
pub fn cache_key(ctx: &Context) -> String {
    if ctx.hash_data.is_empty() {
        format!(
            "{}:{}",
            ctx.req.url,
            ctx.req.headers.get("host").unwrap_or("")
        )
    } else {
        ctx.hash_data.join(":")
    }
}

fn backend_failed(ctx: &mut Context, err: BackendError) -> Stage {
    let line = format!("{}: {}", ctx.req.url, err);
    eprintln!("{}", line);
    ctx.log(line);
    raise_error(ctx, i64::from(err.status()), VclString::from(err.to_string()));
    Stage::Error
}

fn finish_error_object(ctx: &mut Context) {
    let status = ctx.obj.status;
    let reason = match &ctx.obj.response {
        VclString::Value(reason) => reason.clone(),
        _ => reason_phrase(status).to_string(),
    };
    if ctx.obj.body.is_empty() {
        ctx.obj.body = default_error_page(status, &reason);
        ctx.obj
            .headers
            .set("content-type", "text/html; charset=utf-8");
    }
    ctx.obj.response = VclString::from(reason);
}

fn reset_for_restart(ctx: &mut Context) {
    ctx.bereq = Request::default();
    ctx.beresp = Response::default();
    ctx.resp = Response::default();
    ctx.obj = Response::default();
    ctx.ttl = 0;
    ctx.grace = 0;
    ctx.stale_while_revalidate = 0;
    ctx.cacheable = false;
    ctx.hash_data.clear();
    ctx.re_groups.clear();
    ctx.locals.clear();
    ctx.backend_name = None;
    ctx.fastly_error = false;
    ctx.pending = None;
    ctx.obj_hits = 0;
    ctx.obj_age = 0;
}

fn outgoing(ctx: &Context) -> OutgoingResponse {
    let resp = &ctx.resp;
    let mut headers = resp.headers.clone();
    strip_hop_by_hop(&mut headers);
    let reason = match &resp.response {
        VclString::Value(reason) => reason.clone(),
        _ => reason_phrase(resp.status).to_string(),
    };
    let body = if ctx.req.method == "HEAD" {
        Vec::new()
    } else {
        resp.body.clone()
    };
    OutgoingResponse {
        status: resp.status,
        reason,
        headers,
        body,
    }
}

fn fatal(status: u16) -> OutgoingResponse {
    let reason = reason_phrase(status);
    let mut headers = HeaderBag::new();
    headers.set("content-type", "text/html; charset=utf-8");
    OutgoingResponse {
        status,
        reason: reason.to_string(),
        headers,
        body: default_error_page(status, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderBag {
        let mut bag = HeaderBag::new();
        for (name, value) in pairs {
            bag.add(name, *value);
        }
        bag
    }

    #[test]
    fn test_freshness() {
        assert_eq!(freshness(&HeaderBag::new(), 3600), (3600, 0));
        assert_eq!(freshness(&headers(&[("Cache-Control", "max-age=60")]), 3600), (60, 0));
        assert_eq!(
            freshness(&headers(&[("Cache-Control", "max-age=60, s-maxage=120")]), 3600),
            (120, 0)
        );
        assert_eq!(
            freshness(&headers(&[("Cache-Control", "private, max-age=60")]), 3600),
            (0, 0)
        );
        assert_eq!(
            freshness(
                &headers(&[
                    ("Cache-Control", "no-store"),
                    ("Surrogate-Control", "max-age=300, stale-while-revalidate=10"),
                ]),
                3600
            ),
            (300, 10)
        );
        assert_eq!(
            freshness(&headers(&[("Cache-Control", "max-age=5, stale-while-revalidate=30")]), 0),
            (5, 30)
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut bag = headers(&[
            ("Connection", "close, X-Secret"),
            ("Keep-Alive", "timeout=5"),
            ("X-Secret", "1"),
            ("Transfer-Encoding", "chunked"),
            ("Content-Type", "text/plain"),
        ]);
        strip_hop_by_hop(&mut bag);
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_cache_key() {
        let registry = Arc::new(Registry::new());
        let mut req = Request {
            url: "/a".to_string(),
            ..Request::default()
        };
        req.headers.set("host", "example.com");
        let mut ctx = Context::new(registry, req);
        assert_eq!(cache_key(&ctx), "/a:example.com");
        ctx.hash_data = vec!["x".to_string(), "y".to_string()];
        assert_eq!(cache_key(&ctx), "x:y");
    }

    #[test]
    fn test_default_error_page() {
        let page = String::from_utf8(default_error_page(503, reason_phrase(503))).unwrap();
        assert!(page.contains("<title>503 Service Unavailable</title>"));
        assert!(is_cacheable_status(404));
        assert!(!is_cacheable_status(500));
    }
}
