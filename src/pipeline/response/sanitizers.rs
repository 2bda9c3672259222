//! Built-in response sanitizers.

use std::sync::Arc;

use axum::http::HeaderName;
use futures_util::future::{ready, Ready};
use serde_json::Value;

use crate::http::message::GatewayResponse;
use crate::pipeline::error::StageError;
use crate::pipeline::response::ResponseContext;

type Outcome = Ready<Result<GatewayResponse, StageError>>;

pub const REDACTED: &str = "[REDACTED]";

/// Replace the value of every key containing one of `fields` (case-insensitive), at any depth.
///
/// Returns true if anything was redacted.
pub fn redact_value(value: &mut Value, fields: &[String]) -> bool {
    match value {
        Value::Object(map) => {
            let mut changed = false;
            for (key, inner) in map.iter_mut() {
                let key = key.to_ascii_lowercase();
                if fields.iter().any(|f| key.contains(f.as_str())) {
                    *inner = Value::String(REDACTED.to_string());
                    changed = true;
                } else {
                    changed |= redact_value(inner, fields);
                }
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| redact_value(item, fields) | changed),
        _ => false,
    }
}

pub fn redact_sensitive(
    fields: Vec<String>,
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    let fields: Arc<[String]> = fields.into_iter().map(|f| f.to_ascii_lowercase()).collect();
    move |response, _ctx| {
        let Some(mut body) = response.json_body() else {
            return ready(Ok(response));
        };
        if redact_value(&mut body, &fields) {
            ready(Ok(response.with_json(&body)))
        } else {
            ready(Ok(response))
        }
    }
}

pub fn is_internal_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "x-powered-by" || name == "server" || name.starts_with("x-internal-")
}

/// Remove headers that leak backend implementation details.
pub fn strip_internal_headers(
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, _ctx| {
        let internal: Vec<HeaderName> = response
            .headers()
            .keys()
            .filter(|name| is_internal_header(name.as_str()))
            .cloned()
            .collect();
        if internal.is_empty() {
            return ready(Ok(response));
        }
        ready(Ok(response.map_headers(|headers| {
            for name in internal {
                headers.remove(name);
            }
        })))
    }
}
