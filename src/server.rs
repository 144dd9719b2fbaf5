//! HTTP front end: maps hyper requests into the pipeline and back.

use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::context::HeaderBag;
use crate::pipeline::{IncomingRequest, OutgoingResponse, Pipeline};

/// Converts a hyper request. Fails only when the body cannot be read.
pub async fn incoming(
    request: hyper::Request<Body>,
    remote: SocketAddr,
) -> Result<IncomingRequest, hyper::Error> {
    let (parts, body) = request.into_parts();
    let mut headers = HeaderBag::new();
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(value) => headers.add(name.as_str(), value),
            Err(_) => headers.add(name.as_str(), String::from_utf8_lossy(value.as_bytes())),
        }
    }
    let body = hyper::body::to_bytes(body).await?;
    Ok(IncomingRequest {
        method: parts.method.as_str().to_string(),
        url: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        proto: format!("{:?}", parts.version),
        headers,
        body: body.to_vec(),
        client_ip: remote.ip().to_string(),
    })
}

pub fn outgoing(response: OutgoingResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    for (name, value) in response.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => eprintln!("dropping invalid response header {:?}", name),
        }
    }
    out
}

async fn respond(
    pipeline: Arc<Pipeline>,
    remote: SocketAddr,
    request: hyper::Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let request = match incoming(request, remote).await {
        Ok(request) => request,
        Err(err) => {
            eprintln!("{}: could not read request body: {}", remote, err);
            let mut bad = Response::new(Body::empty());
            *bad.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(bad);
        }
    };
    let outcome = pipeline.handle(request).await;
    for line in &outcome.logs {
        println!("{}", line);
    }
    Ok(outgoing(outcome.response))
}

/// Serves `pipeline` on `addr` until `shutdown` resolves, then drains open
/// connections.
pub async fn serve<F>(pipeline: Arc<Pipeline>, addr: SocketAddr, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |conn: &AddrStream| {
        let pipeline = Arc::clone(&pipeline);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                respond(Arc::clone(&pipeline), remote, request)
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    eprintln!("listening on http://{}", server.local_addr());
    server.with_graceful_shutdown(shutdown).await
}

/// Resolves on Ctrl-C.
pub async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        eprintln!("could not listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incoming() {
        let request = hyper::Request::builder()
            .method("POST")
            .uri("http://localhost/a/b?c=1")
            .header("X-Thing", "one")
            .body(Body::from("payload"))
            .unwrap();
        let remote: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let converted = incoming(request, remote).await.unwrap();
        assert_eq!(converted.method, "POST");
        assert_eq!(converted.url, "/a/b?c=1");
        assert_eq!(converted.proto, "HTTP/1.1");
        assert_eq!(converted.headers.get("x-thing"), Some("one"));
        assert_eq!(converted.body, b"payload".to_vec());
        assert_eq!(converted.client_ip, "10.1.2.3");
    }

    #[test]
    fn test_outgoing() {
        let mut headers = HeaderBag::new();
        headers.add("set-cookie", "a=1");
        headers.add("set-cookie", "b=2");
        headers.add("bad header", "x");
        let response = outgoing(OutgoingResponse {
            status: 404,
            reason: "Not Found".to_string(),
            headers,
            body: b"gone".to_vec(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(response.headers().len(), 2);
    }
}
