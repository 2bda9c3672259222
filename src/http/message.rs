//! Request and response value types flowing through the pipelines.
//!
//! # Design Decisions
//! - Values are `Arc`-backed and copy-on-write: every `with_*` method returns a
//!   new value and only clones the shared parts when another holder exists
//! - Concurrent pipelines therefore never observe each other's edits
//! - Headers live in an `http::HeaderMap`, so a name or value that cannot go on
//!   the wire is rejected by the stage that builds it, not dropped at the edge

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::{self, AsHeaderName, IntoHeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::config::RouteConfig;
use crate::observability::tracer::TraceContext;

#[derive(Debug, Clone)]
struct RequestParts {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    peer_addr: Option<IpAddr>,
    secure: bool,
    route: Option<Arc<RouteConfig>>,
    api_version: Option<String>,
    request_id: Option<String>,
    trace: Option<TraceContext>,
    attributes: BTreeMap<String, String>,
    received_at: Instant,
}

/// An inbound request as seen by the request pipeline.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    inner: Arc<RequestParts>,
}

impl GatewayRequest {
    /// Create a request from a method and a path with optional `?query`.
    pub fn new(method: Method, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            inner: Arc::new(RequestParts {
                method,
                path,
                query,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                peer_addr: None,
                secure: false,
                route: None,
                api_version: None,
                request_id: None,
                trace: None,
                attributes: BTreeMap::new(),
                received_at: Instant::now(),
            }),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut RequestParts)) -> Self {
        f(Arc::make_mut(&mut self.inner));
        self
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    /// Path plus query string, as forwarded to backends.
    pub fn path_and_query(&self) -> String {
        match &self.inner.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.inner.path, q),
            _ => self.inner.path.clone(),
        }
    }

    /// First decoded value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.inner.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// First value of `name` when it is visible ASCII.
    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        header_str(&self.inner.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.inner.peer_addr
    }

    /// Whether the client connection was secured (directly or via TLS termination).
    pub fn is_secure(&self) -> bool {
        self.inner.secure
            || self
                .header("x-forwarded-proto")
                .is_some_and(|p| p.eq_ignore_ascii_case("https"))
    }

    pub fn route(&self) -> Option<&Arc<RouteConfig>> {
        self.inner.route.as_ref()
    }

    pub fn api_version(&self) -> Option<&str> {
        self.inner.api_version.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.inner.request_id.as_deref()
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.inner.trace.as_ref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.inner.attributes.get(key).map(String::as_str)
    }

    pub fn received_at(&self) -> Instant {
        self.inner.received_at
    }

    pub fn with_path(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.edit(|p| p.path = path)
    }

    /// Replace every value of `name` with `value`.
    pub fn with_header(self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.edit(|p| {
            p.headers.insert(name, value);
        })
    }

    pub fn without_header(self, name: impl AsHeaderName) -> Self {
        self.edit(|p| {
            p.headers.remove(name);
        })
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        self.edit(|p| p.headers = headers)
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.edit(|p| p.body = body)
    }

    pub fn with_peer_addr(self, addr: IpAddr) -> Self {
        self.edit(|p| p.peer_addr = Some(addr))
    }

    pub fn with_secure(self, secure: bool) -> Self {
        self.edit(|p| p.secure = secure)
    }

    pub fn with_route(self, route: Arc<RouteConfig>) -> Self {
        self.edit(|p| p.route = Some(route))
    }

    pub fn with_api_version(self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.edit(|p| p.api_version = Some(version))
    }

    pub fn with_request_id(self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.edit(|p| p.request_id = Some(id))
    }

    pub fn with_trace(self, trace: TraceContext) -> Self {
        self.edit(|p| p.trace = Some(trace))
    }

    pub fn with_attribute(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.edit(|p| {
            p.attributes.insert(key, value);
        })
    }
}

#[derive(Debug, Clone)]
struct ResponseParts {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// An outbound response as seen by the response pipeline.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    inner: Arc<ResponseParts>,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            inner: Arc::new(ResponseParts {
                status,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(body.into())
    }

    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self::new(status).with_json(value)
    }

    /// A plain JSON error; the response pipeline turns it into the standard envelope.
    pub fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "error": message.into(), "code": code }),
        )
    }

    fn edit(mut self, f: impl FnOnce(&mut ResponseParts)) -> Self {
        f(Arc::make_mut(&mut self.inner));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        header_str(&self.inner.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }

    /// Parsed body when the response declares a JSON content type.
    pub fn json_body(&self) -> Option<Value> {
        if !self.is_json() || self.inner.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.inner.body).ok()
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        self.edit(|p| p.status = status)
    }

    pub fn with_header(self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.edit(|p| {
            p.headers.insert(name, value);
        })
    }

    pub fn append_header(self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.edit(|p| {
            p.headers.append(name, value);
        })
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        self.edit(|p| p.headers = headers)
    }

    pub fn map_headers(self, f: impl FnOnce(&mut HeaderMap)) -> Self {
        self.edit(|p| f(&mut p.headers))
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.edit(|p| p.body = body)
    }

    /// Replace the body with serialized JSON and set the content type.
    pub fn with_json(self, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.with_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body)
    }
}

fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build a header value from runtime text, rejecting control characters.
pub fn header_value(value: impl AsRef<str>) -> Result<HeaderValue, InvalidHeader> {
    let value = value.as_ref();
    HeaderValue::from_str(value).map_err(|_| InvalidHeader(value.to_string()))
}

#[derive(Debug, Clone, Error)]
#[error("value is not a valid header value: {0:?}")]
pub struct InvalidHeader(pub String);

/// Header map from `(name, value)` pairs; names may use any case.
#[cfg(test)]
pub(crate) fn header_map<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> HeaderMap {
    pairs
        .into_iter()
        .map(|(k, v)| {
            (
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = GatewayRequest::new(Method::GET, "/")
            .with_headers(header_map([("Content-Type", "text/plain"), ("Vary", "Origin")]))
            .with_header("content-type", HeaderValue::from_static("application/json"));
        assert_eq!(request.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(request.headers().len(), 2);

        let response = GatewayResponse::new(StatusCode::OK)
            .append_header("vary", HeaderValue::from_static("Origin"))
            .append_header("vary", HeaderValue::from_static("Accept-Encoding"));
        assert_eq!(response.headers().get_all("VARY").iter().count(), 2);
    }

    #[test]
    fn test_header_value_rejects_control_characters() {
        assert!(header_value("abc-123").is_ok());
        let err = header_value("bad\r\nx-injected: 1").unwrap_err();
        assert!(err.to_string().contains("not a valid header value"));
    }

    #[test]
    fn test_non_ascii_value_is_kept_but_not_readable_as_str() {
        let raw = HeaderValue::from_bytes(&[0x66, 0xe9]).unwrap();
        let request = GatewayRequest::new(Method::GET, "/").with_header("x-name", raw.clone());
        assert_eq!(request.headers().get("x-name"), Some(&raw));
        assert_eq!(request.header("x-name"), None);
    }

    #[test]
    fn test_request_copy_on_write() {
        let original = GatewayRequest::new(Method::GET, "/api/v1/meetings?page=2")
            .with_header("x-api-key", HeaderValue::from_static("k1"));
        let edited = original
            .clone()
            .with_header("x-api-key", HeaderValue::from_static("k2"));

        assert_eq!(original.header("x-api-key"), Some("k1"));
        assert_eq!(edited.header("x-api-key"), Some("k2"));
        assert_eq!(original.path(), "/api/v1/meetings");
        assert_eq!(original.query_param("page").as_deref(), Some("2"));
        assert_eq!(original.path_and_query(), "/api/v1/meetings?page=2");
    }

    #[test]
    fn test_response_json_body() {
        let response = GatewayResponse::json(StatusCode::OK, &serde_json::json!({"a": 1}));
        assert!(response.is_json());
        assert_eq!(response.json_body().unwrap()["a"], 1);

        let text = GatewayResponse::text(StatusCode::OK, "{\"a\":1}");
        assert!(text.json_body().is_none());
    }
}
