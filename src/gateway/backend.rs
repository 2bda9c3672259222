//! Backend forwarding.
//!
//! # Responsibilities
//! - Hand a processed request to whatever executes the route's business logic
//! - Forward over HTTP to the route's backend URL (`HttpBackend`)
//! - Run in-process handlers (`FnBackend`)
//!
//! # Design Decisions
//! - The gateway owns the timeout; backends only report failures
//! - Hop-by-hop headers never cross the gateway
//! - Backends are plain HTTP; TLS to backends is not supported

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode, Uri};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::config::RouteConfig;
use crate::http::message::{GatewayRequest, GatewayResponse};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read backend response: {0}")]
    Body(String),
}

impl BackendError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "BACKEND_TIMEOUT",
            _ => "BACKEND_UNAVAILABLE",
        }
    }
}

/// Executes a routed request.
pub trait Backend: Send + Sync {
    fn call(
        &self,
        route: Arc<RouteConfig>,
        request: GatewayRequest,
    ) -> BoxFuture<'_, Result<GatewayResponse, BackendError>>;
}

/// Backend backed by an async closure.
pub struct FnBackend<F> {
    handler: F,
}

impl<F, Fut> FnBackend<F>
where
    F: Fn(Arc<RouteConfig>, GatewayRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<GatewayResponse, BackendError>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(Arc<RouteConfig>, GatewayRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<GatewayResponse, BackendError>> + Send + 'static,
{
    fn call(
        &self,
        route: Arc<RouteConfig>,
        request: GatewayRequest,
    ) -> BoxFuture<'_, Result<GatewayResponse, BackendError>> {
        (self.handler)(route, request).boxed()
    }
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Join the route's backend base URL with the request path and query.
pub fn backend_uri(base: &str, path_and_query: &str) -> Result<Uri, BackendError> {
    let invalid = |reason: String| BackendError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let base = url::Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    if base.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme {}", base.scheme())));
    }
    let prefix = base.path().trim_end_matches('/');
    let authority = match base.port() {
        Some(port) => format!("{}:{}", base.host_str().unwrap_or_default(), port),
        None => base.host_str().unwrap_or_default().to_string(),
    };
    format!("{}://{}{}{}", base.scheme(), authority, prefix, path_and_query)
        .parse::<Uri>()
        .map_err(|e| invalid(e.to_string()))
}

/// Forwards requests over HTTP/1.1 with a pooled hyper client.
pub struct HttpBackend {
    client: Client<HttpConnector, Body>,
    max_response_bytes: usize,
}

impl HttpBackend {
    pub fn new(max_response_bytes: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpConnector::new());
        Self {
            client,
            max_response_bytes,
        }
    }

    fn build_request(
        route: &RouteConfig,
        request: &GatewayRequest,
    ) -> Result<Request<Body>, BackendError> {
        let uri = backend_uri(&route.backend, &request.path_and_query())?;
        let mut outbound = Request::builder()
            .method(request.method().clone())
            .uri(uri)
            .body(Body::from(request.body().clone()))
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let headers = outbound.headers_mut();
        *headers = request.headers().clone();
        strip_hop_by_hop(headers);
        // The body may have been rewritten; hyper recomputes the length
        headers.remove(header::CONTENT_LENGTH);
        Ok(outbound)
    }
}

impl Backend for HttpBackend {
    fn call(
        &self,
        route: Arc<RouteConfig>,
        request: GatewayRequest,
    ) -> BoxFuture<'_, Result<GatewayResponse, BackendError>> {
        Box::pin(async move {
            let outbound = Self::build_request(&route, &request)?;
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;

            let (mut parts, body) = response.into_parts();
            let body = axum::body::to_bytes(Body::new(body), self.max_response_bytes)
                .await
                .map_err(|e| BackendError::Body(e.to_string()))?;

            strip_hop_by_hop(&mut parts.headers);
            parts.headers.remove(header::CONTENT_LENGTH);

            Ok(GatewayResponse::new(parts.status)
                .with_headers(parts.headers)
                .with_body(body))
        })
    }
}
