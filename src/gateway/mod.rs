//! Gateway composition root.
//!
//! # Data Flow
//! ```text
//! GatewayRequest
//!     → Router (no match → 404)
//!     → Tracer (extract inbound context, open request span)
//!     → RequestPipeline (error → JSON error, 429 adds rate limit headers)
//!     → Backend (timeout → 504, failure → 502)
//!     → ResponsePipeline
//!     → MetricsCollector, close span
//!     → GatewayResponse
//! ```
//!
//! # Design Decisions
//! - Tracer, metrics and rate limiter are built once and shared by `Arc`
//! - The route table is swapped atomically on reload; in-flight requests keep
//!   the table they started with
//! - Every outcome, including gateway-generated errors, goes through the
//!   response pipeline so clients see one error shape

pub mod backend;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use axum::http::{header, HeaderValue, StatusCode};
use metrics_exporter_prometheus::BuildError;
use serde::Serialize;
use thiserror::Error;

use crate::config::{GatewayConfig, RouteConfig};
use crate::http::message::{header_value, GatewayRequest, GatewayResponse};
use crate::lifecycle::BackgroundTasks;
use crate::observability::metrics::{
    BusinessMetrics, CollectorStats, EnhancedStats, ErrorMetric, MetricsCollector, RequestMetric,
};
use crate::observability::tracer::{
    ExportError, SpanStatus, TagValue, TraceContext, Tracer, TracerStats,
};
use crate::pipeline::request::{
    enrichers as request_enrichers, filters as request_filters,
    transformers as request_transformers, validators as request_validators,
    ATTR_RATE_LIMIT_LIMIT, ATTR_RATE_LIMIT_REMAINING, ATTR_RATE_LIMIT_RESET,
};
use crate::pipeline::response::{
    enrichers as response_enrichers, filters as response_filters, sanitizers,
    transformers as response_transformers,
};
use crate::pipeline::{PipelineError, RequestPipeline, ResponseContext, ResponsePipeline};
use crate::routing::Router;
use crate::security::access_control::{IpRule, IpRuleError};
use crate::security::rate_limit::{AdaptiveRateLimiter, KeySnapshot, RateLimiterStats};

pub use backend::{Backend, BackendError, FnBackend, HttpBackend};

/// Window used to decide whether the gateway is degraded.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(300);

/// Error rate above which the gateway reports itself degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.5;

/// Request attribute carrying the wire protocol version (e.g. `HTTP/1.1`).
pub const ATTR_PROTOCOL: &str = "http.version";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to initialize span exporter: {0}")]
    Exporter(#[from] ExportError),

    #[error("invalid IP rule: {0}")]
    IpRule(#[from] IpRuleError),

    #[error("failed to build metrics recorder: {0}")]
    Metrics(#[from] BuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub error_rate: f64,
    pub routes: usize,
    pub tracer: TracerStats,
    pub rate_limiter: RateLimiterStats,
    pub metrics: CollectorStats,
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    backend: Option<Arc<dyn Backend>>,
    tracer: Option<Arc<Tracer>>,
    metrics: Option<Arc<MetricsCollector>>,
    rate_limiter: Option<Arc<AdaptiveRateLimiter>>,
    default_stages: bool,
}

impl GatewayBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn tracer(mut self, tracer: Arc<Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Start with empty pipelines instead of the configured built-ins.
    pub fn without_default_stages(mut self) -> Self {
        self.default_stages = false;
        self
    }

    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        let tracer = match self.tracer {
            Some(t) => t,
            None => Arc::new(Tracer::from_config(&config.tracing)?),
        };
        let metrics = match self.metrics {
            Some(m) => m,
            None => Arc::new(MetricsCollector::new(&config.metrics)?),
        };
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(AdaptiveRateLimiter::from_config(&config.rate_limit)));
        let backend = self.backend.unwrap_or_else(|| {
            Arc::new(HttpBackend::new(config.listener.max_body_bytes))
        });

        let mut request_pipeline = RequestPipeline::new().with_tracer(tracer.clone());
        if config.rate_limit.enabled {
            request_pipeline = request_pipeline.with_rate_limiter(rate_limiter.clone());
        }
        let response_pipeline = ResponsePipeline::new();

        if self.default_stages {
            install_request_stages(&request_pipeline, &config, &tracer)?;
            install_response_stages(&response_pipeline, &config);
        }

        tracing::info!(
            routes = config.routes.len(),
            request_stages = request_pipeline.stage_count(),
            response_stages = response_pipeline.stage_count(),
            rate_limit = config.rate_limit.enabled,
            "Gateway initialized"
        );

        Ok(Gateway {
            router: ArcSwap::from_pointee(Router::from_config(config.routes.clone())),
            request_pipeline,
            response_pipeline,
            backend,
            tracer,
            metrics,
            rate_limiter,
            backend_timeout: Duration::from_secs(config.timeouts.backend_secs),
            started_at: Instant::now(),
            config,
        })
    }
}

/// Register the configured request built-ins.
pub fn install_request_stages(
    pipeline: &RequestPipeline,
    config: &GatewayConfig,
    tracer: &Arc<Tracer>,
) -> Result<(), IpRuleError> {
    let rules = &config.request_pipeline;

    if !rules.ip_deny.is_empty() {
        pipeline.add_filter("ip_deny_list", request_filters::ip_deny_list(IpRule::parse_all(&rules.ip_deny)?));
    }
    if !rules.ip_allow.is_empty() {
        pipeline.add_filter("ip_allow_list", request_filters::ip_allow_list(IpRule::parse_all(&rules.ip_allow)?));
    }

    pipeline.add_validator("request_size", request_validators::request_size(rules.max_body_bytes));
    pipeline.add_validator(
        "content_type",
        request_validators::content_type(rules.allowed_content_types.clone()),
    );
    if !rules.required_headers.is_empty() {
        pipeline.add_validator(
            "required_headers",
            request_validators::required_headers(rules.required_headers.clone()),
        );
    }
    pipeline.add_validator("json_body", request_validators::json_body());
    pipeline.add_validator(
        "api_version",
        request_validators::api_version(rules.supported_versions.clone(), rules.default_version.clone()),
    );
    pipeline.add_validator("require_auth", request_validators::require_auth());

    pipeline.add_transformer("normalize_headers", request_transformers::normalize_headers());
    pipeline.add_transformer("normalize_url", request_transformers::normalize_url());

    pipeline.add_enricher("request_id", request_enrichers::request_id());
    pipeline.add_enricher("forwarded_headers", request_enrichers::forwarded_headers());
    if config.tracing.enabled {
        pipeline.add_enricher("trace_headers", request_enrichers::trace_headers(tracer.clone()));
    }
    pipeline.add_enricher("gateway_metadata", request_enrichers::gateway_metadata());
    Ok(())
}

/// Register the configured response built-ins.
pub fn install_response_stages(pipeline: &ResponsePipeline, config: &GatewayConfig) {
    let rules = &config.response_pipeline;

    pipeline.add_filter("skip_upgrades", response_filters::skip_upgrades());

    pipeline.add_transformer("standardize_errors", response_transformers::standardize_errors());
    pipeline.add_transformer("envelope", response_transformers::envelope(rules.envelope));

    if rules.security_headers {
        pipeline.add_enricher("security_headers", response_enrichers::security_headers(rules.hsts_max_age_secs));
    }
    if rules.cors.enabled {
        pipeline.add_enricher("cors", response_enrichers::cors(rules.cors.clone()));
    }
    if !rules.deprecated_versions.is_empty() {
        pipeline.add_enricher("deprecation", response_enrichers::deprecation(rules.deprecated_versions.clone()));
    }
    pipeline.add_enricher("compression_headers", response_enrichers::compression_headers());
    pipeline.add_enricher("response_time", response_enrichers::response_time());
    pipeline.add_enricher("request_id", response_enrichers::request_id());
    pipeline.add_enricher("cache_control", response_enrichers::cache_control());

    if !rules.sensitive_fields.is_empty() {
        pipeline.add_validator("redact_sensitive", sanitizers::redact_sensitive(rules.sensitive_fields.clone()));
    }
    pipeline.add_validator("strip_internal_headers", sanitizers::strip_internal_headers());
    // Last, so the tag covers the final body
    pipeline.add_validator("etag", response_enrichers::etag());
}

pub struct Gateway {
    config: GatewayConfig,
    router: ArcSwap<Router>,
    request_pipeline: RequestPipeline,
    response_pipeline: ResponsePipeline,
    backend: Arc<dyn Backend>,
    tracer: Arc<Tracer>,
    metrics: Arc<MetricsCollector>,
    rate_limiter: Arc<AdaptiveRateLimiter>,
    backend_timeout: Duration,
    started_at: Instant,
}

/// What happened to a request, for metrics and the span.
struct Outcome {
    response: GatewayResponse,
    context: GatewayRequest,
    failure: Option<String>,
    span_status: SpanStatus,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            backend: None,
            tracer: None,
            metrics: None,
            rate_limiter: None,
            default_stages: true,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.rate_limiter
    }

    pub fn request_pipeline(&self) -> &RequestPipeline {
        &self.request_pipeline
    }

    pub fn response_pipeline(&self) -> &ResponsePipeline {
        &self.response_pipeline
    }

    /// Current route table, in match order.
    pub fn routes(&self) -> Vec<Arc<RouteConfig>> {
        self.router.load().routes()
    }

    /// Atomically replace the route table.
    pub fn reload_routes(&self, routes: Vec<RouteConfig>) {
        let router = Router::from_config(routes);
        tracing::info!(routes = router.len(), "Route table reloaded");
        self.router.store(Arc::new(router));
    }

    /// Process one request end to end. Never fails: every error becomes a response.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let method = request.method().to_string();
        let normalized = request_transformers::normalize_path(request.path());
        let lookup = request.clone().with_path(normalized.clone());
        let route_match = self.router.load().match_request(&lookup);

        let operation = match &route_match {
            Some(m) => format!("{method} {}", m.route.path),
            None => format!("{method} {normalized}"),
        };
        let inbound = self.tracer.extract_context(request.headers());
        let trace = self.tracer.start_trace(&operation, inbound.as_ref());
        self.tracer.add_tags(
            trace.span_id,
            [
                ("http.method", TagValue::from(method.as_str())),
                ("http.target", TagValue::from(request.path_and_query())),
                ("span.kind", TagValue::from("server")),
            ],
        );
        let request = request.with_trace(trace);

        let endpoint = route_match
            .as_ref()
            .map(|m| m.route.path.clone())
            .unwrap_or_else(|| normalized.clone());

        let outcome = match route_match {
            None => {
                tracing::debug!(method = %method, path = %request.path(), "No route matched");
                Outcome {
                    response: GatewayResponse::error(
                        StatusCode::NOT_FOUND,
                        "ROUTE_NOT_FOUND",
                        format!("no route for {method} {}", request.path()),
                    ),
                    context: request,
                    failure: None,
                    span_status: SpanStatus::Ok,
                }
            }
            Some(m) => {
                self.tracer
                    .add_tags(trace.span_id, [("gateway.route", TagValue::from(m.route.name.as_str()))]);
                let mut routed = request.with_route(m.route.clone());
                for (name, value) in &m.params {
                    routed = routed.with_attribute(format!("path.{name}"), value.as_str());
                }
                self.dispatch(m.route, routed, &trace).await
            }
        };

        let context = Arc::new(ResponseContext::new(outcome.context));
        let response = self
            .response_pipeline
            .process(outcome.response, context.clone())
            .await;

        self.record(&method, &endpoint, &context, &response, outcome.failure.as_deref());

        let status = response.status().as_u16();
        self.tracer
            .add_tags(trace.span_id, [("http.status_code", TagValue::from(status))]);
        let span_status = match outcome.span_status {
            SpanStatus::Ok if status >= 500 => SpanStatus::Error,
            other => other,
        };
        self.tracer.set_status(trace.span_id, span_status);
        self.tracer.end_span(trace.span_id);

        tracing::debug!(
            request_id = context.request_id().unwrap_or("-"),
            method = %method,
            path = %context.request.path(),
            status,
            duration_ms = context.started_at.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }

    /// Finish a request refused before routing (e.g. an unreadable body).
    pub async fn reject(&self, request: GatewayRequest, response: GatewayResponse) -> GatewayResponse {
        let method = request.method().to_string();
        let endpoint = request_transformers::normalize_path(request.path());
        let context = Arc::new(ResponseContext::new(request));
        let response = self.response_pipeline.process(response, context.clone()).await;
        self.record(&method, &endpoint, &context, &response, None);
        response
    }

    async fn dispatch(
        &self,
        route: Arc<RouteConfig>,
        request: GatewayRequest,
        trace: &TraceContext,
    ) -> Outcome {
        let processed = match self.request_pipeline.process(request.clone()).await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::debug!(
                    route = %route.name,
                    error = %e,
                    code = e.code(),
                    "Request rejected by pipeline"
                );
                return Outcome {
                    response: pipeline_error_response(&e),
                    context: request,
                    failure: None,
                    span_status: SpanStatus::Ok,
                };
            }
        };

        let backend_span = self.tracer.start_span("backend_call", trace);
        self.tracer.add_tags(
            backend_span.span_id,
            [
                ("gateway.backend", TagValue::from(route.backend.as_str())),
                ("span.kind", TagValue::from("client")),
            ],
        );

        let call = self.backend.call(route.clone(), processed.clone());
        let result = match tokio::time::timeout(self.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.backend_timeout)),
        };

        let outcome = match result {
            Ok(response) => {
                let response = with_rate_limit_headers(response, &processed);
                self.tracer.add_tags(
                    backend_span.span_id,
                    [("http.status_code", TagValue::from(response.status().as_u16()))],
                );
                Outcome {
                    response,
                    context: processed,
                    failure: None,
                    span_status: SpanStatus::Ok,
                }
            }
            Err(e) => {
                tracing::warn!(
                    route = %route.name,
                    backend = %route.backend,
                    request_id = processed.request_id().unwrap_or("-"),
                    error = %e,
                    "Backend call failed"
                );
                let span_status = match &e {
                    BackendError::Timeout(_) => SpanStatus::Timeout,
                    _ => SpanStatus::Error,
                };
                self.tracer.add_log(
                    backend_span.span_id,
                    [("event", TagValue::from("error")), ("message", TagValue::from(e.to_string()))],
                );
                self.tracer.set_status(backend_span.span_id, span_status);
                Outcome {
                    response: GatewayResponse::error(e.status(), e.code(), e.to_string()),
                    context: processed,
                    failure: Some(e.to_string()),
                    span_status,
                }
            }
        };
        self.tracer.end_span(backend_span.span_id);
        outcome
    }

    fn record(
        &self,
        method: &str,
        endpoint: &str,
        context: &ResponseContext,
        response: &GatewayResponse,
        failure: Option<&str>,
    ) {
        let status = response.status();
        let duration = context.started_at.elapsed();
        let now = SystemTime::now();
        let cache_hit = status == StatusCode::NOT_MODIFIED
            || response
                .header("x-cache")
                .is_some_and(|v| v.to_ascii_uppercase().starts_with("HIT"));

        self.metrics.record_request(RequestMetric {
            method: method.to_string(),
            path: endpoint.to_string(),
            status: status.as_u16(),
            duration,
            protocol: context
                .request
                .attribute(ATTR_PROTOCOL)
                .unwrap_or("HTTP/1.1")
                .to_string(),
            cache_hit,
            timestamp: now,
        });

        if failure.is_some() || status.is_server_error() {
            let error = failure
                .map(str::to_string)
                .or_else(|| {
                    response
                        .json_body()
                        .and_then(|b| b.get("error").and_then(|e| e.as_str()).map(str::to_string))
                })
                .unwrap_or_else(|| status.to_string());
            self.metrics
                .record_error(ErrorMetric::new(method, endpoint, error, duration, now));
        }
    }

    pub fn health(&self) -> HealthReport {
        let recent = self.metrics.business_metrics(HEALTH_WINDOW);
        let status = if recent.error_rate > DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            uptime_secs: self.started_at.elapsed().as_secs(),
            error_rate: recent.error_rate,
            routes: self.router.load().len(),
            tracer: self.tracer.stats(),
            rate_limiter: self.rate_limiter.stats(),
            metrics: self.metrics.stats(),
        }
    }

    pub fn stats(&self, window: Duration) -> EnhancedStats {
        self.metrics.enhanced_stats(window)
    }

    pub fn business_metrics(&self, window: Duration) -> BusinessMetrics {
        self.metrics.business_metrics(window)
    }

    pub fn export_prometheus(&self) -> String {
        self.metrics.export_prometheus()
    }

    pub fn rate_limit_keys(&self, limit: usize) -> Vec<KeySnapshot> {
        self.rate_limiter.top_keys(limit)
    }

    /// Start trace flushing and the tracer, limiter and metrics sweeps.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();

        let tracer = self.tracer.clone();
        tasks.spawn_interval(
            "trace_flush",
            Duration::from_secs(self.config.tracing.flush_interval_secs),
            move || {
                let tracer = tracer.clone();
                async move {
                    // Failures are counted and retried by the tracer
                    let _ = tracer.flush().await;
                }
            },
        );

        let tracer = self.tracer.clone();
        let max_age = Duration::from_secs(self.config.tracing.max_trace_age_secs);
        tasks.spawn_interval(
            "trace_cleanup",
            Duration::from_secs(self.config.tracing.cleanup_interval_secs),
            move || {
                let evicted = tracer.cleanup(max_age);
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted abandoned traces");
                }
                std::future::ready(())
            },
        );

        let limiter = self.rate_limiter.clone();
        tasks.spawn_interval(
            "rate_limit_cleanup",
            Duration::from_secs(self.config.rate_limit.cleanup_interval_secs),
            move || {
                limiter.evict_idle();
                std::future::ready(())
            },
        );

        let metrics = self.metrics.clone();
        let retention = Duration::from_secs(self.config.metrics.retention_secs);
        tasks.spawn_interval(
            "metrics_cleanup",
            Duration::from_secs(self.config.metrics.cleanup_interval_secs),
            move || {
                metrics.cleanup(retention);
                std::future::ready(())
            },
        );

        tracing::info!(tasks = tasks.len(), "Background tasks started");
        tasks
    }

    /// Stop background tasks and push out any remaining spans.
    pub async fn shutdown(&self, tasks: BackgroundTasks) {
        tasks.shutdown().await;
        match self.tracer.flush().await {
            Ok(exported) => tracing::info!(exported, "Final trace flush complete"),
            Err(e) => tracing::warn!(
                error = %e,
                buffered = self.tracer.stats().buffered_spans,
                "Final trace flush failed"
            ),
        }
    }
}

/// JSON error for a pipeline rejection; 429s carry rate limit headers.
pub fn pipeline_error_response(error: &PipelineError) -> GatewayResponse {
    let response = GatewayResponse::error(error.status(), error.code(), error.to_string());
    match error.rate_limit() {
        Some(decision) => response
            .with_header(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()))
            .with_header("x-ratelimit-limit", HeaderValue::from(decision.limit))
            .with_header("x-ratelimit-remaining", HeaderValue::from(decision.remaining))
            .with_header("x-ratelimit-reset", HeaderValue::from(decision.reset_at_unix_secs())),
        None => response,
    }
}

fn with_rate_limit_headers(response: GatewayResponse, request: &GatewayRequest) -> GatewayResponse {
    let headers = [
        ("x-ratelimit-limit", ATTR_RATE_LIMIT_LIMIT),
        ("x-ratelimit-remaining", ATTR_RATE_LIMIT_REMAINING),
        ("x-ratelimit-reset", ATTR_RATE_LIMIT_RESET),
    ];
    headers
        .into_iter()
        .fold(response, |response, (name, attribute)| {
            match request.attribute(attribute).map(header_value) {
                Some(Ok(value)) => response.with_header(name, value),
                _ => response,
            }
        })
}
