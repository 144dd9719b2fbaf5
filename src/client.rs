//! Plain-HTTP origin client over hyper.

use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Client, Method};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{HeaderBag, Request};
use crate::error::BackendError;
use crate::pipeline::{strip_hop_by_hop, BackendResponse, Fetch, FetchFuture};
use crate::registry::Backend;

/// One pooled hyper client per distinct backend connect timeout.
#[derive(Clone, Default)]
pub struct HttpClient {
    clients: Arc<Mutex<HashMap<Duration, Client<HttpConnector, Body>>>>,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client whose connector gives up after `connect_timeout`.
    fn client_for(&self, connect_timeout: Duration) -> Client<HttpConnector, Body> {
        self.clients
            .lock()
            .entry(connect_timeout)
            .or_insert_with(|| {
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(Some(connect_timeout));
                connector.set_nodelay(true);
                Client::builder().build(connector)
            })
            .clone()
    }
}

fn connect_error(backend: &Backend, message: impl ToString) -> BackendError {
    BackendError::Connect {
        backend: backend.name.clone(),
        message: message.to_string(),
    }
}

/// Headers forwarded to `backend`: hop-by-hop removed, `Host` rewritten and
/// the client's host and scheme recorded.
pub fn forwarded_headers(backend: &Backend, request: &Request) -> HeaderBag {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Some(host) = request.headers.get("host") {
        if !headers.contains("x-forwarded-host") {
            headers.set("x-forwarded-host", host);
        }
    }
    if !headers.contains("x-forwarded-proto") {
        headers.set("x-forwarded-proto", "http");
    }
    headers.set("host", backend.authority());
    headers
}

pub fn backend_uri(backend: &Backend, url: &str) -> String {
    let path = if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{}", url)
    };
    format!(
        "{}://{}:{}{}",
        backend.scheme(),
        backend.host,
        backend.port,
        path
    )
}

fn build_request(
    backend: &Backend,
    request: &Request,
) -> Result<hyper::Request<Body>, BackendError> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|err| connect_error(backend, err))?;
    let body = if method == Method::GET || method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(request.body.clone())
    };

    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(backend_uri(backend, &request.url));
    for (name, value) in forwarded_headers(backend, request).iter() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| connect_error(backend, err))?;
        let value = HeaderValue::from_str(value).map_err(|err| connect_error(backend, err))?;
        builder = builder.header(name, value);
    }
    builder.body(body).map_err(|err| connect_error(backend, err))
}

impl HttpClient {
    pub async fn send(
        &self,
        backend: Arc<Backend>,
        request: Request,
    ) -> Result<BackendResponse, BackendError> {
        if backend.ssl {
            return Err(connect_error(&backend, "TLS backends are not supported"));
        }
        let outbound = build_request(&backend, &request)?;

        let response = match tokio::time::timeout(
            backend.first_byte_timeout,
            self.client_for(backend.connect_timeout).request(outbound),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(connect_error(&backend, err)),
            Err(_) => return Err(BackendError::Timeout(backend.name.clone())),
        };

        let status = response.status();
        let mut headers = HeaderBag::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.add(name.as_str(), value);
            }
        }
        strip_hop_by_hop(&mut headers);

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| connect_error(&backend, err))?;

        Ok(BackendResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}

impl Fetch for HttpClient {
    fn fetch(&self, backend: Arc<Backend>, request: Request) -> FetchFuture {
        let client = self.clone();
        Box::pin(async move { client.send(backend, request).await })
    }
}
