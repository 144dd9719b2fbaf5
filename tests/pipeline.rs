use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use vcl_edge::cache::ManualClock;
use vcl_edge::context::{HeaderBag, Request};
use vcl_edge::error::BackendError;
use vcl_edge::load;
use vcl_edge::pipeline::{
    BackendResponse, Fetch, FetchFuture, IncomingRequest, Outcome, Pipeline, PipelineSettings,
};
use vcl_edge::registry::Backend;

type Handler = dyn Fn(&Backend, &Request) -> Result<BackendResponse, BackendError> + Send + Sync;

/// An origin that answers from a closure and remembers what it was sent.
struct Origin {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Request)>>,
}

impl Origin {
    fn new<F>(handler: F) -> Arc<Origin>
    where
        F: Fn(&Backend, &Request) -> Result<BackendResponse, BackendError> + Send + Sync + 'static,
    {
        Arc::new(Origin {
            handler: Box::new(handler),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Origin> {
        Arc::new(Origin {
            handler: Box::new(|_, _| Ok(ok("late"))),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn backends(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    fn last_request(&self) -> Request {
        self.calls.lock().last().unwrap().1.clone()
    }
}

impl Fetch for Origin {
    fn fetch(&self, backend: Arc<Backend>, request: Request) -> FetchFuture {
        let result = (self.handler)(&*backend, &request);
        self.calls.lock().push((backend.name.clone(), request));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

fn response(status: u16, body: &str) -> BackendResponse {
    let mut headers = HeaderBag::new();
    headers.set("content-type", "text/plain");
    BackendResponse {
        status,
        reason: String::new(),
        headers,
        body: body.as_bytes().to_vec(),
    }
}

fn ok(body: &str) -> BackendResponse {
    response(200, body)
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000, 0).single().unwrap()
}

fn build(source: &str, origin: &Arc<Origin>, settings: PipelineSettings) -> (Pipeline, Arc<ManualClock>) {
    let vcl = load(source).unwrap();
    let clock = Arc::new(ManualClock::new(epoch()));
    let pipeline = Pipeline::new(vcl.program, vcl.registry, origin.clone(), settings)
        .with_clock(clock.clone());
    (pipeline, clock)
}

fn get(url: &str) -> IncomingRequest {
    IncomingRequest::new("GET", url).header("Host", "example.com")
}

fn header<'a>(outcome: &'a Outcome, name: &str) -> Option<&'a str> {
    outcome.response.headers.get(name)
}

const ORIGIN: &str = r#"backend origin { .host = "127.0.0.1"; .port = "8081"; }"#;

fn with_origin(body: &str) -> String {
    format!("{}\n{}", ORIGIN, body)
}

const CACHING: &str = r#"
    sub vcl_fetch {
        set beresp.ttl = 300s;
        set beresp.grace = 3600s;
        set beresp.stale_while_revalidate = 10s;
        return(deliver);
    }
"#;

#[tokio::test]
async fn caching_follows_ttl_grace_and_swr() {
    let origin = Origin::new(|_, _| Ok(ok("hello")));
    let (pipeline, clock) = build(&with_origin(CACHING), &origin, PipelineSettings::default());

    let first = pipeline.handle(get("/")).await;
    assert_eq!(first.response.status, 200);
    assert_eq!(first.response.body, b"hello".to_vec());
    assert_eq!(header(&first, "x-cache"), Some("MISS"));
    assert_eq!(header(&first, "x-backend"), Some("origin"));
    assert_eq!(origin.calls(), 1);

    clock.set(epoch() + ChronoDuration::seconds(299));
    let fresh = pipeline.handle(get("/")).await;
    assert_eq!(header(&fresh, "x-cache"), Some("HIT"));
    assert_eq!(header(&fresh, "x-cache-hits"), Some("1"));
    assert_eq!(header(&fresh, "x-cache-age"), Some("299"));
    assert_eq!(fresh.response.body, b"hello".to_vec());
    assert_eq!(origin.calls(), 1);

    clock.set(epoch() + ChronoDuration::seconds(3911));
    let expired = pipeline.handle(get("/")).await;
    assert_eq!(header(&expired, "x-cache"), Some("MISS"));
    assert_eq!(origin.calls(), 2);
    let entry = pipeline.cache().get("/:example.com").unwrap();
    assert_eq!(entry.created_at, epoch() + ChronoDuration::seconds(3911));
}

#[tokio::test]
async fn stale_hit_is_served_then_evicted() {
    let origin = Origin::new(|_, _| Ok(ok("hello")));
    let (pipeline, clock) = build(&with_origin(CACHING), &origin, PipelineSettings::default());

    pipeline.handle(get("/")).await;
    clock.set(epoch() + ChronoDuration::seconds(301));
    let stale = pipeline.handle(get("/")).await;
    assert_eq!(header(&stale, "x-cache"), Some("HIT-STALE"));
    assert_eq!(stale.response.body, b"hello".to_vec());
    assert_eq!(origin.calls(), 1);

    for _ in 0..10 {
        if pipeline.cache().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(pipeline.cache().is_empty());

    let refetched = pipeline.handle(get("/")).await;
    assert_eq!(header(&refetched, "x-cache"), Some("MISS"));
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn uncacheable_responses_are_not_stored() {
    let origin = Origin::new(|_, request| {
        let mut response = ok("private");
        if request.url == "/private" {
            response.headers.set("cache-control", "private, max-age=600");
        }
        Ok(response)
    });
    let (pipeline, _) = build(ORIGIN, &origin, PipelineSettings::default());

    pipeline.handle(get("/private")).await;
    let again = pipeline.handle(get("/private")).await;
    assert_eq!(header(&again, "x-cache"), Some("MISS"));
    assert_eq!(origin.calls(), 2);

    pipeline.handle(IncomingRequest::new("POST", "/public")).await;
    pipeline.handle(IncomingRequest::new("POST", "/public")).await;
    assert_eq!(origin.calls(), 4);

    pipeline.handle(get("/public")).await;
    let cached = pipeline.handle(get("/public")).await;
    assert_eq!(header(&cached, "x-cache"), Some("HIT"));
    assert_eq!(origin.calls(), 5);
}

#[tokio::test]
async fn acl_membership_decides_access() {
    let source = with_origin(
        r#"
        acl internal_acl { "192.168.1.0"/24; }
        sub vcl_recv {
            if (client.ip ~ internal_acl) {
                error 403 "internal";
            }
        }
        "#,
    );
    let origin = Origin::new(|_, _| Ok(ok("public")));
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());

    let mut inside = get("/");
    inside.client_ip = "192.168.1.5".to_string();
    let denied = pipeline.handle(inside).await;
    assert_eq!(denied.response.status, 403);
    assert_eq!(denied.response.reason, "internal");
    let page = String::from_utf8(denied.response.body.clone()).unwrap();
    assert!(page.contains("403 internal"));
    assert_eq!(origin.calls(), 0);

    let mut outside = get("/");
    outside.client_ip = "10.0.0.1".to_string();
    let allowed = pipeline.handle(outside).await;
    assert_eq!(allowed.response.status, 200);
    assert_eq!(origin.calls(), 1);
}

const DIRECTOR: &str = r#"
    backend main { .host = "10.0.0.1"; .port = "80"; }
    backend static { .host = "10.0.0.2"; .port = "80"; }
    director main_director random {
        .quorum = 50%;
        { .backend = main; .weight = 1; }
        { .backend = static; .weight = 1; }
    }
    sub vcl_recv {
        set req.backend = main_director;
        if (req.method == "POST") {
            return(pass);
        }
    }
"#;

#[tokio::test]
async fn post_through_director_skips_unhealthy_member() {
    let origin = Origin::new(|backend, _| Ok(ok(&backend.name)));
    let (pipeline, _) = build(DIRECTOR, &origin, PipelineSettings::default());
    pipeline.registry().set_healthy("main", false);

    for _ in 0..5 {
        let outcome = pipeline.handle(IncomingRequest::new("POST", "/api/x")).await;
        assert_eq!(outcome.response.status, 200);
        assert_eq!(header(&outcome, "x-backend"), Some("static"));
    }
    assert!(origin.backends().iter().all(|name| name == "static"));
    assert_eq!(origin.last_request().method, "POST");
}

#[tokio::test]
async fn director_below_quorum_is_unavailable() {
    let origin = Origin::new(|_, _| Ok(ok("x")));
    let (pipeline, _) = build(DIRECTOR, &origin, PipelineSettings::default());
    pipeline.registry().set_healthy("main", false);
    pipeline.registry().set_healthy("static", false);

    let outcome = pipeline.handle(IncomingRequest::new("POST", "/api/x")).await;
    assert_eq!(outcome.response.status, 503);
    assert_eq!(origin.calls(), 0);
    assert!(!outcome.response.body.is_empty());
}

#[tokio::test]
async fn restarts_are_bounded() {
    let origin = Origin::new(|_, _| Ok(ok("never")));
    let source = with_origin("sub vcl_recv { return(restart); }");
    let settings = PipelineSettings {
        max_restarts: 2,
        ..PipelineSettings::default()
    };
    let (pipeline, _) = build(&source, &origin, settings);

    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 503);
    assert!(outcome
        .logs
        .iter()
        .any(|line| line.contains("restart limit of 2 exceeded")));
    assert_eq!(origin.calls(), 0);
}

#[tokio::test]
async fn restart_reenters_recv_with_counter() {
    let origin = Origin::new(|_, _| Ok(ok("second")));
    let source = with_origin(
        r#"
        sub vcl_recv {
            if (req.restarts == 0) {
                set req.url = "/moved";
                return(restart);
            }
        }
        "#,
    );
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());
    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 200);
    assert_eq!(origin.last_request().url, "/moved");
}

#[tokio::test]
async fn vcl_log_cannot_change_the_response() {
    let origin = Origin::new(|_, _| Ok(ok("body")));
    let source = with_origin(
        r#"
        sub vcl_deliver {
            set resp.http.X-Final = "deliver";
        }
        sub vcl_log {
            set resp.http.X-Final = "log";
            set resp.status = 500;
            log "vcl_log ran";
        }
        "#,
    );
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());
    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 200);
    assert_eq!(header(&outcome, "x-final"), Some("deliver"));
    assert_eq!(outcome.response.body, b"body".to_vec());
    assert!(outcome.logs.contains(&"vcl_log ran".to_string()));
}

#[tokio::test]
async fn regex_groups_and_headers_reach_the_backend() {
    let origin = Origin::new(|_, _| Ok(ok("api")));
    let source = with_origin(
        r#"
        sub vcl_recv {
            set req.http.X-Trace = "v";
            if (req.url ~ "^/api/") {
                set req.http.X-Group = re.group.0;
            }
        }
        sub vcl_deliver {
            set resp.http.X-Trace = req.http.X-Trace;
        }
        "#,
    );
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());
    let outcome = pipeline.handle(get("/api/users")).await;

    let sent = origin.last_request();
    assert_eq!(sent.headers.get("x-group"), Some("/api/"));
    assert_eq!(sent.headers.get("x-trace"), Some("v"));
    assert_eq!(header(&outcome, "x-trace"), Some("v"));
}

#[tokio::test]
async fn backend_failures_map_to_statuses() {
    let refused = Origin::new(|backend, _| {
        Err(BackendError::Connect {
            backend: backend.name.clone(),
            message: "connection refused".to_string(),
        })
    });
    let (pipeline, _) = build(ORIGIN, &refused, PipelineSettings::default());
    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 502);
    assert_eq!(header(&outcome, "content-type"), Some("text/html; charset=utf-8"));
    assert!(String::from_utf8(outcome.response.body.clone())
        .unwrap()
        .contains("502"));

    let slow = Origin::slow(Duration::from_secs(5));
    let settings = PipelineSettings {
        backend_timeout: Duration::from_millis(20),
        ..PipelineSettings::default()
    };
    let (pipeline, _) = build(ORIGIN, &slow, settings);
    assert_eq!(pipeline.handle(get("/")).await.response.status, 504);

    let (pipeline, _) = build(ORIGIN, &slow, PipelineSettings::default());
    pipeline.shutdown();
    assert_eq!(pipeline.handle(get("/")).await.response.status, 503);

    let (pipeline, _) = build("sub vcl_recv { }", &slow, PipelineSettings::default());
    assert_eq!(pipeline.handle(get("/")).await.response.status, 503);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_fetch() {
    let slow = Origin::slow(Duration::from_secs(5));
    let (pipeline, _) = build(ORIGIN, &slow, PipelineSettings::default());
    let pipeline = Arc::new(pipeline);

    let running = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.handle(get("/")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.shutdown();
    let outcome = running.await.unwrap();
    assert_eq!(outcome.response.status, 503);
}

#[tokio::test]
async fn server_errors_retry_through_fallback_director() {
    let origin = Origin::new(|backend, _| {
        if backend.name == "primary" {
            Ok(response(500, "broken"))
        } else {
            Ok(ok("rescued"))
        }
    });
    let source = r#"
        backend primary { .host = "10.0.0.1"; .port = "80"; }
        backend backup { .host = "10.0.0.2"; .port = "80"; }
        director backup_dir fallback {
            { .backend = backup; }
        }
    "#;
    let settings = PipelineSettings {
        fallback_director: Some("backup_dir".to_string()),
        ..PipelineSettings::default()
    };
    let (pipeline, _) = build(source, &origin, settings);
    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.body, b"rescued".to_vec());
    assert_eq!(origin.backends(), vec!["primary", "backup"]);
}

#[tokio::test]
async fn evaluation_errors_fall_back_to_vcl_error() {
    let origin = Origin::new(|_, _| Ok(ok("unreached")));
    let source = with_origin(r#"sub vcl_recv { set req.http.X = std.nope("a"); }"#);
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());
    let outcome = pipeline.handle(get("/")).await;
    assert_eq!(outcome.response.status, 503);
    assert!(outcome
        .logs
        .iter()
        .any(|line| line.starts_with("vcl_recv: unknown function std.nope")));
    assert_eq!(origin.calls(), 0);
}

#[tokio::test]
async fn vcl_error_can_synthesize_a_response() {
    let origin = Origin::new(|_, _| Ok(ok("unreached")));
    let source = with_origin(
        r#"
        sub vcl_recv {
            if (req.url == "/old") {
                error 404 "gone";
            }
        }
        sub vcl_error {
            set obj.http.Content-Type = "text/plain";
            synthetic "custom body";
            return(deliver);
        }
        "#,
    );
    let (pipeline, _) = build(&source, &origin, PipelineSettings::default());
    let outcome = pipeline.handle(get("/old")).await;
    assert_eq!(outcome.response.status, 404);
    assert_eq!(outcome.response.reason, "gone");
    assert_eq!(outcome.response.body, b"custom body".to_vec());
    assert_eq!(header(&outcome, "content-type"), Some("text/plain"));
}

#[tokio::test]
async fn routes_pick_a_backend_when_vcl_does_not() {
    let origin = Origin::new(|backend, _| Ok(ok(&backend.name)));
    let source = r#"
        backend web { .host = "10.0.0.1"; .port = "80"; }
        backend api { .host = "10.0.0.2"; .port = "80"; }
    "#;
    let settings = PipelineSettings {
        routes: vec![vcl_edge::config::Route {
            pattern: "^/api/".to_string(),
            backend: "api".to_string(),
        }],
        ..PipelineSettings::default()
    };
    let (pipeline, _) = build(source, &origin, settings);
    pipeline.handle(get("/api/v1")).await;
    pipeline.handle(get("/index.html")).await;
    assert_eq!(origin.backends(), vec!["api", "web"]);
}
