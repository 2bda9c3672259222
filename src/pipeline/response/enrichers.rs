//! Built-in response enrichers: headers derived from the request, the route and the body.

use std::sync::Arc;

use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue};
use futures_util::future::{ready, Ready};

use crate::config::{CacheStrategy, CorsConfig, DeprecatedVersion};
use crate::http::message::{header_value, GatewayResponse};
use crate::pipeline::error::StageError;
use crate::pipeline::response::filters::is_bodyless;
use crate::pipeline::response::ResponseContext;

type Outcome = Ready<Result<GatewayResponse, StageError>>;

/// Bodies at or below this size are not worth compressing.
pub const COMPRESSION_MIN_BYTES: usize = 1024;

pub fn is_compressible(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("javascript")
        || ct.contains("xml")
        || ct.contains("svg")
}

/// Add `token` to the response's `Vary` list unless already listed.
pub fn append_vary(headers: &mut HeaderMap, token: &'static str) {
    let listed = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| {
            let t = t.trim();
            t == "*" || t.eq_ignore_ascii_case(token)
        });
    if !listed {
        headers.append(header::VARY, HeaderValue::from_static(token));
    }
}

/// Advertise `Vary: Accept-Encoding` on responses the HTTP layer will compress.
pub fn compression_headers(
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, _ctx| {
        let compressible = response.content_type().is_some_and(is_compressible)
            && response.body().len() > COMPRESSION_MIN_BYTES
            && response.header(header::CONTENT_ENCODING).is_none();
        if !compressible {
            return ready(Ok(response));
        }
        ready(Ok(response.map_headers(|headers| append_vary(headers, "Accept-Encoding"))))
    }
}

const SECURITY_DEFAULTS: [(HeaderName, &str); 7] = [
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
    (
        HeaderName::from_static("permissions-policy"),
        "geolocation=(), microphone=(), camera=()",
    ),
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'none'; frame-ancestors 'none'",
    ),
    (
        HeaderName::from_static("x-permitted-cross-domain-policies"),
        "none",
    ),
];

/// Standard hardening headers, kept when the backend already set them.
/// HSTS is only sent on secure requests.
pub fn security_headers(
    hsts_max_age_secs: u64,
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    let hsts = (hsts_max_age_secs > 0)
        .then(|| header_value(format!("max-age={hsts_max_age_secs}; includeSubDomains")).ok())
        .flatten();
    move |response, ctx| {
        let secure = ctx.request.is_secure();
        let hsts = hsts.clone();
        let response = response.map_headers(|headers| {
            for (name, value) in SECURITY_DEFAULTS {
                if !headers.contains_key(&name) {
                    headers.insert(name, HeaderValue::from_static(value));
                }
            }
            if let Some(hsts) = hsts.filter(|_| secure) {
                headers.insert(header::STRICT_TRANSPORT_SECURITY, hsts);
            }
        });
        ready(Ok(response))
    }
}

/// Policy values rendered once when the stage is built.
struct CorsHeaders {
    allow_methods: Option<HeaderValue>,
    allow_headers: Option<HeaderValue>,
    expose_headers: Option<HeaderValue>,
    max_age: Option<HeaderValue>,
}

impl CorsHeaders {
    fn new(policy: &CorsConfig) -> Result<Self, StageError> {
        let list = |items: &[String]| -> Result<Option<HeaderValue>, StageError> {
            if items.is_empty() {
                return Ok(None);
            }
            Ok(Some(header_value(items.join(", "))?))
        };
        Ok(Self {
            allow_methods: list(&policy.allowed_methods)?,
            allow_headers: list(&policy.allowed_headers)?,
            expose_headers: list(&policy.exposed_headers)?,
            max_age: (policy.max_age_secs > 0).then(|| HeaderValue::from(policy.max_age_secs)),
        })
    }
}

fn apply_cors(
    response: GatewayResponse,
    ctx: &ResponseContext,
    policy: &CorsConfig,
    rendered: &CorsHeaders,
) -> Result<GatewayResponse, StageError> {
    let Some(origin) = ctx.request.headers().get(header::ORIGIN) else {
        return Ok(response);
    };
    let listed = origin
        .to_str()
        .is_ok_and(|o| policy.allowed_origins.iter().any(|a| a.eq_ignore_ascii_case(o)));
    let wildcard = policy.allowed_origins.iter().any(|o| o == "*");
    if !listed && !wildcard {
        return Ok(response);
    }

    // Only explicitly listed origins are echoed, and only they may carry credentials
    let echo = listed && (policy.allow_credentials || !wildcard);
    let allow_origin = if echo {
        origin.clone()
    } else {
        HeaderValue::from_static("*")
    };
    Ok(response.map_headers(|headers| {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if echo {
            append_vary(headers, "Origin");
            if policy.allow_credentials {
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
        }
        for (name, value) in [
            (header::ACCESS_CONTROL_ALLOW_METHODS, &rendered.allow_methods),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, &rendered.allow_headers),
            (header::ACCESS_CONTROL_EXPOSE_HEADERS, &rendered.expose_headers),
            (header::ACCESS_CONTROL_MAX_AGE, &rendered.max_age),
        ] {
            if let Some(value) = value {
                headers.insert(name, value.clone());
            }
        }
    }))
}

/// CORS headers for requests whose `Origin` the policy allows.
pub fn cors(policy: CorsConfig) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    let rendered = CorsHeaders::new(&policy).map(Arc::new);
    let policy = Arc::new(policy);
    move |response, ctx| {
        let result = match &rendered {
            Ok(rendered) => apply_cors(response, &ctx, &policy, rendered),
            Err(e) => Err(e.clone()),
        };
        ready(result)
    }
}

fn apply_deprecation(
    response: GatewayResponse,
    entry: &DeprecatedVersion,
) -> Result<GatewayResponse, StageError> {
    let mut response = response.with_header("deprecation", HeaderValue::from_static("true"));
    if let Some(sunset) = &entry.sunset {
        response = response.with_header("sunset", header_value(sunset)?);
    }
    if let Some(link) = &entry.link {
        response = response.append_header(
            header::LINK,
            header_value(format!("<{link}>; rel=\"deprecation\""))?,
        );
    }
    Ok(response)
}

/// Mark responses to deprecated API versions.
pub fn deprecation(
    versions: Vec<DeprecatedVersion>,
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    let versions: Arc<[DeprecatedVersion]> = versions.into();
    move |response, ctx| {
        let entry = ctx
            .request
            .api_version()
            .and_then(|version| versions.iter().find(|v| v.version == version));
        match entry {
            Some(entry) => ready(apply_deprecation(response, entry)),
            None => ready(Ok(response)),
        }
    }
}

/// Weak validator `W/"<len hex>-<crc32 hex>"` over the body.
pub fn weak_etag(body: &[u8]) -> String {
    format!("W/\"{:x}-{:08x}\"", body.len(), crc32fast::hash(body))
}

/// Set an ETag on non-empty bodies that do not already carry one.
pub fn etag() -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, _ctx| {
        if is_bodyless(response.status())
            || response.body().is_empty()
            || response.headers().contains_key(header::ETAG)
        {
            return ready(Ok(response));
        }
        let tag = header_value(weak_etag(response.body()));
        ready(tag.map(|tag| response.with_header(header::ETAG, tag)).map_err(StageError::from))
    }
}

/// `x-response-time: <ms>ms` measured from when the gateway received the request.
pub fn response_time() -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, ctx| {
        let elapsed = ctx.started_at.elapsed().as_secs_f64() * 1000.0;
        let value = header_value(format!("{elapsed:.2}ms"));
        ready(value.map(|v| response.with_header("x-response-time", v)).map_err(StageError::from))
    }
}

pub fn request_id() -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, ctx| match ctx.request_id() {
        Some(id) => ready(
            header_value(id)
                .map(|id| response.with_header("x-request-id", id))
                .map_err(StageError::from),
        ),
        None => ready(Ok(response)),
    }
}

pub fn cache_control_value(strategy: CacheStrategy, ttl_secs: u64) -> String {
    match strategy {
        CacheStrategy::NoCache => "no-cache".to_string(),
        CacheStrategy::NoStore => "no-store".to_string(),
        CacheStrategy::Public => format!("public, max-age={ttl_secs}"),
        CacheStrategy::Private => format!("private, max-age={ttl_secs}"),
    }
}

/// `Cache-Control` from the route's strategy. Errors are never cacheable.
pub fn cache_control() -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Outcome + Send + Sync {
    |response, ctx| {
        if response.headers().contains_key(header::CACHE_CONTROL) {
            return ready(Ok(response));
        }
        let value = if response.status().as_u16() >= 400 {
            "no-store".to_string()
        } else {
            match ctx.route() {
                Some(route) => cache_control_value(route.cache_strategy, route.cache_ttl_secs),
                None => return ready(Ok(response)),
            }
        };
        ready(
            header_value(value)
                .map(|v| response.with_header(header::CACHE_CONTROL, v))
                .map_err(StageError::from),
        )
    }
}
