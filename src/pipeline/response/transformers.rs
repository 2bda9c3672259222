//! Built-in response transformers: error standardization and success envelopes.

use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::{ready, Ready};
use serde_json::{json, Map, Value};

use crate::config::EnvelopeFormat;
use crate::http::message::GatewayResponse;
use crate::pipeline::error::StageError;
use crate::pipeline::response::filters::is_bodyless;
use crate::pipeline::response::ResponseContext;

type Outcome = Ready<Result<GatewayResponse, StageError>>;

pub fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// `NOT_FOUND`, `TOO_MANY_REQUESTS`, ... or `HTTP_<code>` for unnamed statuses.
pub fn status_code_name(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => reason
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>()
            .replace("__", "_"),
        None => format!("HTTP_{}", status.as_u16()),
    }
}

fn string_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn already_wrapped(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key("success"))
}

/// Rewrite error responses into `{success:false, error, status, timestamp, ...}`.
pub fn standardize_errors() -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, ctx| {
        let status = response.status();
        if status.as_u16() < 400 {
            return ready(Ok(response));
        }

        let upstream = response.json_body();
        if upstream.as_ref().is_some_and(already_wrapped) {
            return ready(Ok(response));
        }
        let object = upstream.as_ref().and_then(Value::as_object);

        let error = object
            .and_then(|o| string_field(o, "error").or_else(|| string_field(o, "message")))
            .map(str::to_string)
            .or_else(|| {
                if upstream.is_some() || response.body().is_empty() {
                    return None;
                }
                std::str::from_utf8(response.body())
                    .ok()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Error").to_string());

        let code = object
            .and_then(|o| string_field(o, "code"))
            .map(str::to_string)
            .unwrap_or_else(|| status_code_name(status));

        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(error));
        body.insert("status".into(), json!(status.as_u16()));
        body.insert("timestamp".into(), Value::String(rfc3339_now()));
        if let Some(id) = ctx.request_id() {
            body.insert("requestId".into(), Value::String(id.to_string()));
        }
        if let Some(details) = object.and_then(|o| o.get("details")) {
            body.insert("details".into(), details.clone());
        }
        body.insert("code".into(), Value::String(code));

        ready(Ok(response.with_json(&Value::Object(body))))
    }
}

/// Wrap successful JSON bodies per `format`.
pub fn envelope(
    format: EnvelopeFormat,
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    move |response, ctx| {
        if format == EnvelopeFormat::None
            || response.status().as_u16() >= 400
            || is_bodyless(response.status())
        {
            return ready(Ok(response));
        }
        let Some(data) = response.json_body() else {
            return ready(Ok(response));
        };
        if already_wrapped(&data) {
            return ready(Ok(response));
        }

        let wrapped = match format {
            EnvelopeFormat::Minimal => json!({ "data": data }),
            _ => {
                let mut body = Map::new();
                body.insert("success".into(), Value::Bool(true));
                body.insert("data".into(), data);
                body.insert("timestamp".into(), Value::String(rfc3339_now()));
                if let Some(id) = ctx.request_id() {
                    body.insert("requestId".into(), Value::String(id.to_string()));
                }
                Value::Object(body)
            }
        };
        ready(Ok(response.with_json(&wrapped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::GatewayRequest;
    use axum::http::Method;

    fn ctx(request_id: Option<&str>) -> Arc<ResponseContext> {
        let mut req = GatewayRequest::new(Method::GET, "/api/v1/meetings");
        if let Some(id) = request_id {
            req = req.with_request_id(id);
        }
        Arc::new(ResponseContext::new(req))
    }

    #[test]
    fn test_status_code_names() {
        assert_eq!(status_code_name(StatusCode::NOT_FOUND), "NOT_FOUND");
        assert_eq!(status_code_name(StatusCode::TOO_MANY_REQUESTS), "TOO_MANY_REQUESTS");
        assert_eq!(status_code_name(StatusCode::from_u16(599).unwrap()), "HTTP_599");
    }

    #[tokio::test]
    async fn test_standardize_upstream_json_error() {
        let res = GatewayResponse::json(
            StatusCode::UNPROCESSABLE_ENTITY,
            &json!({"message": "title is required", "code": "INVALID_MEETING", "details": {"field": "title"}}),
        );
        let out = standardize_errors()(res, ctx(Some("req-1"))).await.unwrap();
        let body = out.json_body().unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "title is required");
        assert_eq!(body["status"], 422);
        assert_eq!(body["code"], "INVALID_MEETING");
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(body["details"]["field"], "title");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_standardize_text_and_empty_errors() {
        let res = GatewayResponse::text(StatusCode::BAD_GATEWAY, "upstream exploded");
        let body = standardize_errors()(res, ctx(None)).await.unwrap().json_body().unwrap();
        assert_eq!(body["error"], "upstream exploded");
        assert_eq!(body["code"], "BAD_GATEWAY");
        assert!(body.get("requestId").is_none());

        let res = GatewayResponse::new(StatusCode::NOT_FOUND);
        let body = standardize_errors()(res, ctx(None)).await.unwrap().json_body().unwrap();
        assert_eq!(body["error"], "Not Found");
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_standardize_leaves_success_alone() {
        let res = GatewayResponse::json(StatusCode::OK, &json!({"id": 1}));
        let out = standardize_errors()(res.clone(), ctx(None)).await.unwrap();
        assert_eq!(out.body(), res.body());
    }

    #[tokio::test]
    async fn test_envelope_formats() {
        let res = || GatewayResponse::json(StatusCode::OK, &json!([1, 2]));

        let body = envelope(EnvelopeFormat::Envelope)(res(), ctx(Some("r")))
            .await
            .unwrap()
            .json_body()
            .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], json!([1, 2]));
        assert_eq!(body["requestId"], "r");

        let body = envelope(EnvelopeFormat::Minimal)(res(), ctx(None))
            .await
            .unwrap()
            .json_body()
            .unwrap();
        assert_eq!(body, json!({"data": [1, 2]}));

        let out = envelope(EnvelopeFormat::None)(res(), ctx(None)).await.unwrap();
        assert_eq!(out.json_body().unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_envelope_leaves_bodyless_statuses_empty() {
        let not_modified = GatewayResponse::new(StatusCode::NOT_MODIFIED);
        let out = envelope(EnvelopeFormat::Envelope)(not_modified, ctx(None)).await.unwrap();
        assert!(out.body().is_empty());
        assert!(out.header("content-type").is_none());
    }

    #[tokio::test]
    async fn test_envelope_skips_wrapped_errors_and_non_json() {
        let wrap = envelope(EnvelopeFormat::Envelope);

        let wrapped = GatewayResponse::json(StatusCode::OK, &json!({"success": true, "data": 1}));
        let out = wrap(wrapped, ctx(None)).await.unwrap();
        assert_eq!(out.json_body().unwrap(), json!({"success": true, "data": 1}));

        let error = GatewayResponse::json(StatusCode::BAD_REQUEST, &json!({"error": "x"}));
        assert_eq!(wrap(error, ctx(None)).await.unwrap().json_body().unwrap(), json!({"error": "x"}));

        let text = GatewayResponse::text(StatusCode::OK, "plain");
        assert_eq!(wrap(text, ctx(None)).await.unwrap().body().as_ref(), b"plain");
    }
}
