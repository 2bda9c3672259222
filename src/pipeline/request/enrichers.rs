//! Built-in request enrichers.

use std::sync::Arc;

use axum::http::HeaderValue;
use futures_util::future::{ready, Ready};
use uuid::Uuid;

use crate::http::message::{header_value, GatewayRequest};
use crate::observability::tracer::{propagation, Tracer};
use crate::pipeline::error::StageError;

type Outcome = Ready<Result<GatewayRequest, StageError>>;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Inbound ids longer than this, or with characters outside this set, are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Keep a well-formed inbound `x-request-id`, otherwise mint a UUID v4.
pub fn request_id() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let id = request
            .header(X_REQUEST_ID)
            .map(str::trim)
            .filter(|id| is_valid_request_id(id))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let result = header_value(&id)
            .map(|value| request.with_header(X_REQUEST_ID, value).with_request_id(id))
            .map_err(StageError::from);
        ready(result)
    }
}

fn add_forwarded(request: GatewayRequest) -> Result<GatewayRequest, StageError> {
    let Some(peer) = request.peer_addr() else {
        return Ok(request);
    };
    let forwarded_for = match request.header("x-forwarded-for") {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {peer}"),
        _ => peer.to_string(),
    };
    let real_ip = match request.headers().get("x-real-ip") {
        Some(existing) => existing.clone(),
        None => header_value(peer.to_string())?,
    };
    let proto = HeaderValue::from_static(if request.is_secure() { "https" } else { "http" });
    Ok(request
        .with_header("x-forwarded-for", header_value(forwarded_for)?)
        .with_header("x-real-ip", real_ip)
        .with_header("x-forwarded-proto", proto))
}

/// Append the client to `x-forwarded-for` and set `x-real-ip`.
pub fn forwarded_headers() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| ready(add_forwarded(request))
}

/// Propagate the request's span to the backend in every header scheme.
pub fn trace_headers(tracer: Arc<Tracer>) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    move |request| {
        let Some(ctx) = request.trace().copied() else {
            return ready(Ok(request));
        };
        let mut headers = tracer.inject_context(ctx.span_id);
        if headers.is_empty() {
            // Unsampled or already closed; still propagate the ids
            headers = propagation::inject(&ctx);
        }
        let mut out = request.headers().clone();
        out.extend(headers);
        ready(Ok(request.with_headers(out)))
    }
}

/// Stamp the matched route and the gateway's receive time.
pub fn gateway_metadata() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let route = request
            .route()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| "unmatched".to_string());
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let result = header_value(route).and_then(|route| {
            Ok(request
                .with_header("x-gateway-route", route)
                .with_header("x-gateway-timestamp", header_value(timestamp)?))
        });
        ready(result.map_err(StageError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, TracingConfig};
    use crate::observability::tracer::LogSpanExporter;
    use axum::http::Method;

    fn get() -> GatewayRequest {
        GatewayRequest::new(Method::GET, "/api/v1/meetings")
    }

    #[tokio::test]
    async fn test_request_id_kept_or_minted() {
        let enrich = request_id();
        let kept = enrich(get().with_header(X_REQUEST_ID, HeaderValue::from_static("abc-123")))
            .await
            .unwrap();
        assert_eq!(kept.request_id(), Some("abc-123"));

        let minted = enrich(get().with_header(X_REQUEST_ID, HeaderValue::from_static("bad id <script>")))
            .await
            .unwrap();
        let id = minted.request_id().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(minted.header(X_REQUEST_ID), Some(id));
    }

    #[tokio::test]
    async fn test_forwarded_headers() {
        let enrich = forwarded_headers();
        let req = get()
            .with_peer_addr("10.1.1.1".parse().unwrap())
            .with_header("x-forwarded-for", HeaderValue::from_static("203.0.113.5"));
        let out = enrich(req).await.unwrap();
        assert_eq!(out.header("x-forwarded-for"), Some("203.0.113.5, 10.1.1.1"));
        assert_eq!(out.header("x-real-ip"), Some("10.1.1.1"));
        assert_eq!(out.header("x-forwarded-proto"), Some("http"));
    }

    #[tokio::test]
    async fn test_trace_headers_all_schemes() {
        let tracer = Arc::new(Tracer::new(&TracingConfig::default(), Arc::new(LogSpanExporter)));
        let ctx = tracer.start_trace("GET /api/v1/meetings", None);
        let out = trace_headers(tracer.clone())(get().with_trace(ctx)).await.unwrap();

        assert_eq!(out.header("x-trace-id"), Some(ctx.trace_id.to_hex().as_str()));
        assert!(out.header("traceparent").is_some());
        assert!(out.header("x-b3-traceid").is_some());

        let untraced = trace_headers(tracer)(get()).await.unwrap();
        assert!(untraced.header("traceparent").is_none());
    }

    #[tokio::test]
    async fn test_gateway_metadata() {
        let route = Arc::new(RouteConfig {
            name: "meetings".into(),
            ..RouteConfig::default()
        });
        let out = gateway_metadata()(get().with_route(route)).await.unwrap();
        assert_eq!(out.header("x-gateway-route"), Some("meetings"));
        let ts = out.header("x-gateway-timestamp").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
