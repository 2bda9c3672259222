//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the API gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Route definitions mapping requests to backends.
    pub routes: Vec<RouteConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Adaptive rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Distributed tracing settings.
    pub tracing: TracingConfig,

    /// Metrics collection settings.
    pub metrics: MetricsConfig,

    /// Built-in request pipeline stages.
    pub request_pipeline: RequestPipelineConfig,

    /// Built-in response pipeline stages.
    pub response_pipeline: ResponsePipelineConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Hard cap on buffered request bodies, enforced before the pipeline runs.
    pub max_body_bytes: usize,

    /// Whether the gateway sits behind TLS termination (enables HSTS).
    pub behind_tls: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
            behind_tls: false,
        }
    }
}

/// Route configuration mapping requests to a backend target.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// Route identifier for logging, metrics and rate-limit keys.
    pub name: String,

    /// Path pattern. Segments starting with `:` match any single segment,
    /// a trailing `*` matches the remainder.
    pub path: String,

    /// HTTP method to match, `*` for any.
    #[serde(default = "default_method")]
    pub method: String,

    /// Backend base URL (e.g., "http://127.0.0.1:3000").
    pub backend: String,

    /// Whether callers must present credentials.
    #[serde(default)]
    pub requires_auth: bool,

    /// Caching policy advertised to clients.
    #[serde(default)]
    pub cache_strategy: CacheStrategy,

    /// Cache lifetime in seconds for cacheable strategies.
    #[serde(default)]
    pub cache_ttl_secs: u64,

    /// Route-specific rate limit, overriding the global default.
    #[serde(default)]
    pub rate_limit: Option<RouteRateLimit>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

fn default_method() -> String {
    "*".to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            path: "/*".to_string(),
            method: default_method(),
            backend: "http://127.0.0.1:3000".to_string(),
            requires_auth: false,
            cache_strategy: CacheStrategy::default(),
            cache_ttl_secs: 0,
            rate_limit: None,
            priority: 0,
        }
    }
}

/// Cache strategy declared by a route.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    #[default]
    NoCache,
    NoStore,
    Public,
    Private,
}

/// Declared rate limit for a route.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteRateLimit {
    /// Baseline number of requests per window.
    pub requests: u32,
    /// Window size in milliseconds.
    pub window_ms: u64,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total time for request/response at the listener, in seconds.
    pub request_secs: u64,

    /// Time allowed for a single backend call, in seconds.
    pub backend_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            backend_secs: 25,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Default baseline requests per window when a route declares none.
    pub requests: u32,

    /// Default window size in milliseconds.
    pub window_ms: u64,

    /// Keys idle for longer than this are evicted.
    pub idle_ttl_secs: u64,

    /// Interval of the eviction sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: 100,
            window_ms: 60_000,
            idle_ttl_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

/// Distributed tracing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Enable span creation.
    pub enabled: bool,

    /// `service.name` resource attribute on exported spans.
    pub service_name: String,

    /// Fraction of root traces that are recorded, in `[0, 1]`.
    pub sample_rate: f64,

    /// Collector endpoint; spans are logged locally when absent.
    pub collector_url: Option<String>,

    /// Export flush interval in seconds.
    pub flush_interval_secs: u64,

    /// Timeout for a single export request in seconds.
    pub export_timeout_secs: u64,

    /// Hard cap on finished spans held for export.
    pub max_buffered_spans: usize,

    /// Traces older than this are evicted by the cleanup sweep.
    pub max_trace_age_secs: u64,

    /// Interval of the cleanup sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "api-gateway".to_string(),
            sample_rate: 1.0,
            collector_url: None,
            flush_interval_secs: 10,
            export_timeout_secs: 5,
            max_buffered_spans: 10_000,
            max_trace_age_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

/// Metrics collection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples older than this are discarded.
    pub retention_secs: u64,

    /// Upper bound on retained samples per kind.
    pub max_samples: usize,

    /// Interval of the retention sweep.
    pub cleanup_interval_secs: u64,

    /// Default aggregation window for stats endpoints.
    pub stats_window_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            max_samples: 100_000,
            cleanup_interval_secs: 300,
            stats_window_secs: 60 * 60,
        }
    }
}

/// Built-in request stages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestPipelineConfig {
    /// Content types accepted on POST/PUT/PATCH.
    pub allowed_content_types: Vec<String>,

    /// Maximum declared `Content-Length`.
    pub max_body_bytes: u64,

    /// Headers every request must carry.
    pub required_headers: Vec<String>,

    /// Accepted API versions (e.g., "1", "2").
    pub supported_versions: Vec<String>,

    /// Version assumed when the request names none.
    pub default_version: String,

    /// Client IPs or CIDR blocks allowed through; empty disables the filter.
    pub ip_allow: Vec<String>,

    /// Client IPs or CIDR blocks rejected.
    pub ip_deny: Vec<String>,
}

impl Default for RequestPipelineConfig {
    fn default() -> Self {
        Self {
            allowed_content_types: vec![
                "application/json".to_string(),
                "application/x-www-form-urlencoded".to_string(),
                "multipart/form-data".to_string(),
            ],
            max_body_bytes: 10 * 1024 * 1024,
            required_headers: Vec::new(),
            supported_versions: vec!["1".to_string()],
            default_version: "1".to_string(),
            ip_allow: Vec::new(),
            ip_deny: Vec::new(),
        }
    }
}

/// Shape applied to successful JSON bodies.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeFormat {
    #[default]
    None,
    Envelope,
    Minimal,
}

/// Built-in response stages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponsePipelineConfig {
    /// Wrapping applied to successful JSON bodies.
    pub envelope: EnvelopeFormat,

    /// JSON keys (case-insensitive substrings) whose values are redacted.
    pub sensitive_fields: Vec<String>,

    /// Emit the standard security header set.
    pub security_headers: bool,

    /// `max-age` for Strict-Transport-Security.
    pub hsts_max_age_secs: u64,

    /// CORS policy.
    pub cors: CorsConfig,

    /// API versions announced as deprecated.
    pub deprecated_versions: Vec<DeprecatedVersion>,
}

impl Default for ResponsePipelineConfig {
    fn default() -> Self {
        Self {
            envelope: EnvelopeFormat::None,
            sensitive_fields: vec![
                "password".to_string(),
                "token".to_string(),
                "secret".to_string(),
                "api_key".to_string(),
            ],
            security_headers: true,
            hsts_max_age_secs: 31_536_000,
            cors: CorsConfig::default(),
            deprecated_versions: Vec::new(),
        }
    }
}

/// CORS policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Allowed origins; `*` allows any.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: ["content-type", "authorization", "x-api-key", "x-request-id"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            exposed_headers: ["x-request-id", "x-ratelimit-remaining"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            allow_credentials: false,
            max_age_secs: 86_400,
        }
    }
}

/// A deprecated API version announcement.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeprecatedVersion {
    pub version: String,
    /// HTTP-date after which the version is removed.
    pub sunset: Option<String>,
    /// Migration guide URL.
    pub link: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Output format: pretty, compact or json.
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[routes]]
            name = "meetings"
            path = "/api/v1/meetings"
            backend = "http://127.0.0.1:3000"
            rate_limit = { requests = 10, window_ms = 1000 }
            "#,
        )
        .unwrap();

        assert_eq!(config.routes.len(), 1);
        let route = &config.routes[0];
        assert_eq!(route.method, "*");
        assert_eq!(route.cache_strategy, CacheStrategy::NoCache);
        assert_eq!(route.rate_limit, Some(RouteRateLimit { requests: 10, window_ms: 1000 }));
        assert_eq!(config.tracing.flush_interval_secs, 10);
        assert_eq!(config.metrics.retention_secs, 86_400);
        assert_eq!(config.response_pipeline.envelope, EnvelopeFormat::None);
    }

    #[test]
    fn test_enum_spelling() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [response_pipeline]
            envelope = "minimal"

            [[routes]]
            name = "docs"
            path = "/api/v1/documents/*"
            backend = "http://127.0.0.1:3001"
            cache_strategy = "public"
            cache_ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.response_pipeline.envelope, EnvelopeFormat::Minimal);
        assert_eq!(config.routes[0].cache_strategy, CacheStrategy::Public);
    }
}
