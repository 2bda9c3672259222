//! Built-in request transformers.

use axum::http::{HeaderMap, HeaderValue};
use futures_util::future::{ready, Ready};

use crate::http::message::GatewayRequest;
use crate::pipeline::error::StageError;

type Outcome = Ready<Result<GatewayRequest, StageError>>;

fn trim_value(value: &HeaderValue) -> HeaderValue {
    let bytes = value.as_bytes();
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    // A sub-slice of a valid value is still valid
    HeaderValue::from_bytes(&bytes[start..end]).unwrap_or_else(|_| value.clone())
}

/// Trim surrounding whitespace from every header value.
///
/// Names need no work: `HeaderMap` stores them lower-cased.
pub fn normalize_headers() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let untrimmed = request.headers().values().any(|v| {
            let bytes = v.as_bytes();
            bytes.first().is_some_and(u8::is_ascii_whitespace)
                || bytes.last().is_some_and(u8::is_ascii_whitespace)
        });
        if !untrimmed {
            return ready(Ok(request));
        }
        let mut headers = HeaderMap::with_capacity(request.headers().len());
        for (name, value) in request.headers() {
            headers.append(name.clone(), trim_value(value));
        }
        ready(Ok(request.with_headers(headers)))
    }
}

/// Collapse repeated slashes and drop one trailing slash (except on `/`).
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

pub fn normalize_url() -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    |request| {
        let normalized = normalize_path(request.path());
        if normalized == request.path() {
            ready(Ok(request))
        } else {
            ready(Ok(request.with_path(normalized)))
        }
    }
}
