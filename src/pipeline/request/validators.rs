//! Built-in request validators.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use futures_util::future::{ready, Ready};

use crate::http::message::GatewayRequest;
use crate::pipeline::error::StageError;

type Outcome = Ready<Result<GatewayRequest, StageError>>;

fn has_body_semantics(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// POST, PUT and PATCH must declare one of `allowed` content types.
pub fn content_type(allowed: Vec<String>) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    let allowed: Arc<[String]> = allowed
        .into_iter()
        .map(|t| t.to_ascii_lowercase())
        .collect();
    move |request| {
        if !has_body_semantics(request.method()) {
            return ready(Ok(request));
        }
        let result = match request.header("content-type") {
            None => Err(StageError::new("Content-Type header is required")
                .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE)),
            Some(value) => {
                let value = value.to_ascii_lowercase();
                if allowed.iter().any(|a| value.contains(a.as_str())) {
                    Ok(request)
                } else {
                    Err(StageError::new(format!("unsupported content type: {value}"))
                        .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE))
                }
            }
        };
        ready(result)
    }
}

/// Declared and actual body size must not exceed `max_bytes`.
pub fn request_size(max_bytes: u64) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    move |request| {
        let too_large = |size: u64| {
            StageError::new(format!("request body of {size} bytes exceeds limit of {max_bytes}"))
                .with_status(StatusCode::PAYLOAD_TOO_LARGE)
        };
        let declared = request
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(size) = declared.filter(|size| *size > max_bytes) {
            return ready(Err(too_large(size)));
        }
        let actual = request.body().len() as u64;
        if actual > max_bytes {
            return ready(Err(too_large(actual)));
        }
        ready(Ok(request))
    }
}

/// Every header in `names` must be present; the error lists all that are missing.
pub fn required_headers(names: Vec<String>) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    let names: Arc<[String]> = names.into();
    move |request| {
        let missing: Vec<&str> = names
            .iter()
            .filter(|name| !request.headers().contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            ready(Ok(request))
        } else {
            ready(Err(StageError::new(format!(
                "missing required headers: {}",
                missing.join(", ")
            ))))
        }
    }
}

/// JSON bodies must parse. The request body itself is left untouched.
pub fn json_body() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let is_json = request
            .header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
        if !is_json || request.body().is_empty() {
            return ready(Ok(request));
        }
        match serde_json::from_slice::<serde_json::Value>(request.body()) {
            Ok(_) => ready(Ok(request)),
            Err(e) => ready(Err(StageError::new(format!("invalid JSON body: {e}")))),
        }
    }
}

/// Version from a `/api/v<N>/` path segment, then `x-api-version`, then `?version=`.
pub fn requested_version(request: &GatewayRequest) -> Option<String> {
    let from_path = request
        .path()
        .strip_prefix("/api/v")
        .and_then(|rest| {
            let end = rest.find('/').unwrap_or(rest.len());
            let digits = &rest[..end];
            (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
                .then(|| digits.to_string())
        });
    from_path
        .or_else(|| {
            request
                .header("x-api-version")
                .map(|v| v.trim().trim_start_matches(['v', 'V']).to_string())
                .filter(|v| !v.is_empty())
        })
        .or_else(|| request.query_param("version"))
}

/// Resolve the API version, rejecting versions outside `supported`.
pub fn api_version(
    supported: Vec<String>,
    default: String,
) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    let supported: Arc<[String]> = supported.into();
    move |request| {
        let version = match requested_version(&request) {
            Some(v) => v,
            None => return ready(Ok(request.with_api_version(default.clone()))),
        };
        if supported.iter().any(|s| *s == version) {
            ready(Ok(request.with_api_version(version)))
        } else {
            ready(Err(StageError::new(format!(
                "unsupported API version: {version}"
            ))))
        }
    }
}

/// Routes marked `requires_auth` need a bearer token or API key.
pub fn require_auth() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let required = request.route().is_some_and(|r| r.requires_auth);
        if !required {
            return ready(Ok(request));
        }
        let bearer = request
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .is_some_and(|token| !token.trim().is_empty());
        let api_key = request
            .header("x-api-key")
            .is_some_and(|k| !k.trim().is_empty());
        if bearer || api_key {
            ready(Ok(request))
        } else {
            ready(Err(StageError::unauthorized("authentication required")))
        }
    }
}
