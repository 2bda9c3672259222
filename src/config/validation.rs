//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (windows > 0, sample rate within [0, 1])
//! - Check route table integrity (unique names, well-formed paths and backends)
//! - Parse IP filter rules ahead of time
//! - Refuse CORS policies that would grant credentials to any origin
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, RouteConfig};
use crate::security::access_control::IpRule;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address '{}'", config.listener.bind_address),
        ));
    }
    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "admin.bind_address",
            format!("invalid socket address '{}'", config.admin.bind_address),
        ));
    }
    if config.timeouts.backend_secs == 0 {
        errors.push(ValidationError::new("timeouts.backend_secs", "must be greater than 0"));
    }

    if config.rate_limit.requests == 0 {
        errors.push(ValidationError::new("rate_limit.requests", "must be greater than 0"));
    }
    if config.rate_limit.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be greater than 0"));
    }

    let tracing = &config.tracing;
    if !(0.0..=1.0).contains(&tracing.sample_rate) {
        errors.push(ValidationError::new(
            "tracing.sample_rate",
            format!("{} is outside [0, 1]", tracing.sample_rate),
        ));
    }
    if let Some(url) = &tracing.collector_url {
        if url::Url::parse(url).is_err() {
            errors.push(ValidationError::new(
                "tracing.collector_url",
                format!("invalid URL '{}'", url),
            ));
        }
    }
    if tracing.flush_interval_secs == 0 {
        errors.push(ValidationError::new("tracing.flush_interval_secs", "must be greater than 0"));
    }
    if tracing.max_buffered_spans == 0 {
        errors.push(ValidationError::new("tracing.max_buffered_spans", "must be greater than 0"));
    }

    if config.metrics.max_samples == 0 {
        errors.push(ValidationError::new("metrics.max_samples", "must be greater than 0"));
    }

    let pipeline = &config.request_pipeline;
    if !pipeline.default_version.is_empty()
        && !pipeline.supported_versions.contains(&pipeline.default_version)
    {
        errors.push(ValidationError::new(
            "request_pipeline.default_version",
            format!("'{}' is not a supported version", pipeline.default_version),
        ));
    }
    for (field, rules) in [
        ("request_pipeline.ip_allow", &pipeline.ip_allow),
        ("request_pipeline.ip_deny", &pipeline.ip_deny),
    ] {
        for rule in rules {
            if let Err(e) = IpRule::parse(rule) {
                errors.push(ValidationError::new(field, e.to_string()));
            }
        }
    }

    let cors = &config.response_pipeline.cors;
    if cors.enabled && cors.allow_credentials && cors.allowed_origins.iter().any(|o| o == "*") {
        errors.push(ValidationError::new(
            "response_pipeline.cors.allow_credentials",
            "cannot be combined with a '*' allowed origin",
        ));
    }

    validate_routes(&config.routes, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_routes(routes: &[RouteConfig], errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();
    for (i, route) in routes.iter().enumerate() {
        let field = |name: &str| format!("routes[{}].{}", i, name);

        if route.name.is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::new(
                field("name"),
                format!("duplicate route name '{}'", route.name),
            ));
        }
        if !route.path.starts_with('/') {
            errors.push(ValidationError::new(field("path"), "must start with '/'"));
        }
        if route.method != "*" && route.method.parse::<axum::http::Method>().is_err() {
            errors.push(ValidationError::new(
                field("method"),
                format!("invalid method '{}'", route.method),
            ));
        }
        match url::Url::parse(&route.backend) {
            Ok(url) if url.scheme() == "http" => {}
            _ => errors.push(ValidationError::new(
                field("backend"),
                format!("'{}' is not an http URL", route.backend),
            )),
        }
        if let Some(limit) = route.rate_limit {
            if limit.requests == 0 || limit.window_ms == 0 {
                errors.push(ValidationError::new(
                    field("rate_limit"),
                    "requests and window_ms must be greater than 0",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteRateLimit;

    fn route(name: &str, path: &str) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            path: path.into(),
            method: "GET".into(),
            backend: "http://127.0.0.1:3000".into(),
            requires_auth: false,
            cache_strategy: Default::default(),
            cache_ttl_secs: 0,
            rate_limit: None,
            priority: 0,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = GatewayConfig::default();
        config.tracing.sample_rate = 1.5;
        config.tracing.collector_url = Some("not a url".into());
        config.request_pipeline.ip_deny = vec!["10.0.0.0/99".into()];
        config.routes.push(route("a", "/x"));
        config.routes.push(route("a", "no-slash"));
        let mut bad = route("b", "/y");
        bad.backend = "ftp://files".into();
        bad.rate_limit = Some(RouteRateLimit { requests: 0, window_ms: 1000 });
        config.routes.push(bad);

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"tracing.sample_rate"));
        assert!(fields.contains(&"tracing.collector_url"));
        assert!(fields.contains(&"request_pipeline.ip_deny"));
        assert!(fields.contains(&"routes[1].name"));
        assert!(fields.contains(&"routes[1].path"));
        assert!(fields.contains(&"routes[2].backend"));
        assert!(fields.contains(&"routes[2].rate_limit"));
        assert_eq!(errors.len(), 7);
    }

    #[test]
    fn test_rejects_https_backend() {
        let mut config = GatewayConfig::default();
        let mut tls = route("tls", "/secure");
        tls.backend = "https://svc.internal".into();
        config.routes.push(tls);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "routes[0].backend");
    }

    #[test]
    fn test_rejects_credentialed_wildcard_cors() {
        let mut config = GatewayConfig::default();
        config.response_pipeline.cors.allow_credentials = true;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "response_pipeline.cors.allow_credentials");

        config.response_pipeline.cors.allowed_origins = vec!["https://app.example.com".into()];
        assert!(validate_config(&config).is_ok());
    }
}
