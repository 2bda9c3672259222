//! Request pipeline.
//!
//! # Data Flow
//! ```text
//! GatewayRequest
//!     → filters      (false or failure → 403, stop)
//!     → validators   (failure → 400 or the stage's status, stop)
//!     → throttle     (only with a rate limiter; rejection → 429, stop)
//!     → transformers (failure → 500, stop)
//!     → enrichers    (failure → 500, stop)
//!     → GatewayRequest for the backend
//! ```
//!
//! # Design Decisions
//! - Fail fast: the first failing stage ends the request
//! - Throttling runs after validation so malformed requests never spend budget
//! - Each stage receives the previous stage's output by value

pub mod enrichers;
pub mod filters;
pub mod transformers;
pub mod validators;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::http::message::GatewayRequest;
use crate::observability::tracer::{SpanStatus, TagValue, Tracer};
use crate::pipeline::error::{PipelineError, StageError};
use crate::pipeline::registry::{StageKind, StageRegistry};
use crate::security::access_control::resolve_client_ip;
use crate::security::rate_limit::{AdaptiveRateLimiter, RateLimitPolicy};

pub type RequestFilterFn =
    dyn Fn(GatewayRequest) -> BoxFuture<'static, Result<bool, StageError>> + Send + Sync;

pub type RequestStageFn =
    dyn Fn(GatewayRequest) -> BoxFuture<'static, Result<GatewayRequest, StageError>> + Send + Sync;

/// Request attributes set when the throttle gate admits a request.
pub const ATTR_RATE_LIMIT_LIMIT: &str = "rate_limit.limit";
pub const ATTR_RATE_LIMIT_REMAINING: &str = "rate_limit.remaining";
pub const ATTR_RATE_LIMIT_RESET: &str = "rate_limit.reset";

/// Caller identity verified by an authenticating stage.
///
/// Raw credentials such as `x-api-key` are never used as the limiting
/// identity; a client could mint a fresh budget per request by rotating them.
pub const ATTR_PRINCIPAL: &str = "auth.principal";

/// `<identity>:<route>`, identity being the verified principal, the client IP or `anonymous`.
pub fn limiting_key(request: &GatewayRequest) -> String {
    let identity = request
        .attribute(ATTR_PRINCIPAL)
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("principal={p}"))
        .or_else(|| resolve_client_ip(request.headers(), request.peer_addr()).map(|ip| ip.to_string()))
        .unwrap_or_else(|| "anonymous".to_string());
    let route = request.route().map(|r| r.name.as_str()).unwrap_or("default");
    format!("{identity}:{route}")
}

#[derive(Default)]
pub struct RequestPipeline {
    filters: StageRegistry<RequestFilterFn>,
    validators: StageRegistry<RequestStageFn>,
    transformers: StageRegistry<RequestStageFn>,
    enrichers: StageRegistry<RequestStageFn>,
    rate_limiter: Option<Arc<AdaptiveRateLimiter>>,
    tracer: Option<Arc<Tracer>>,
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn add_filter<F, Fut>(&self, name: &str, filter: F)
    where
        F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StageError>> + Send + 'static,
    {
        let op: Arc<RequestFilterFn> = Arc::new(move |req| filter(req).boxed());
        self.filters.insert(name, op);
    }

    pub fn add_validator<F, Fut>(&self, name: &str, validator: F)
    where
        F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayRequest, StageError>> + Send + 'static,
    {
        self.validators.insert(name, boxed(validator));
    }

    pub fn add_transformer<F, Fut>(&self, name: &str, transformer: F)
    where
        F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayRequest, StageError>> + Send + 'static,
    {
        self.transformers.insert(name, boxed(transformer));
    }

    pub fn add_enricher<F, Fut>(&self, name: &str, enricher: F)
    where
        F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayRequest, StageError>> + Send + 'static,
    {
        self.enrichers.insert(name, boxed(enricher));
    }

    fn registry(&self, kind: StageKind) -> Option<&StageRegistry<RequestStageFn>> {
        match kind {
            StageKind::Filter => None,
            StageKind::Validator => Some(&self.validators),
            StageKind::Transformer => Some(&self.transformers),
            StageKind::Enricher => Some(&self.enrichers),
        }
    }

    pub fn remove(&self, kind: StageKind, name: &str) -> bool {
        match self.registry(kind) {
            Some(registry) => registry.remove(name),
            None => self.filters.remove(name),
        }
    }

    pub fn clear(&self, kind: StageKind) {
        match self.registry(kind) {
            Some(registry) => registry.clear(),
            None => self.filters.clear(),
        }
    }

    pub fn clear_all(&self) {
        for kind in StageKind::ALL {
            self.clear(kind);
        }
    }

    pub fn set_enabled(&self, kind: StageKind, name: &str, enabled: bool) -> bool {
        match self.registry(kind) {
            Some(registry) => registry.set_enabled(name, enabled),
            None => self.filters.set_enabled(name, enabled),
        }
    }

    pub fn stage_names(&self, kind: StageKind) -> Vec<String> {
        match self.registry(kind) {
            Some(registry) => registry.names(),
            None => self.filters.names(),
        }
    }

    pub fn stage_count(&self) -> usize {
        self.filters.len() + self.validators.len() + self.transformers.len() + self.enrichers.len()
    }

    /// Run every enabled stage in order.
    pub async fn process(&self, request: GatewayRequest) -> Result<GatewayRequest, PipelineError> {
        let span = match (&self.tracer, request.trace()) {
            (Some(tracer), Some(ctx)) => Some((tracer, tracer.start_span("request_pipeline", ctx))),
            _ => None,
        };

        let result = self.run(request).await;

        if let Some((tracer, ctx)) = span {
            match &result {
                Ok(_) => {
                    tracer.set_status(ctx.span_id, SpanStatus::Ok);
                }
                Err(e) => {
                    tracer.add_tags(
                        ctx.span_id,
                        [
                            ("pipeline.failed_stage", TagValue::from(e.stage().unwrap_or("throttle"))),
                            ("error.code", TagValue::from(e.code())),
                            ("error", TagValue::from(true)),
                        ],
                    );
                    tracer.set_status(ctx.span_id, SpanStatus::Error);
                }
            }
            tracer.end_span(ctx.span_id);
        }
        result
    }

    async fn run(&self, mut request: GatewayRequest) -> Result<GatewayRequest, PipelineError> {
        for (name, stage) in self.filters.snapshot().iter().filter(|(_, s)| s.enabled) {
            match (stage.operation)(request.clone()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(stage = %name, path = %request.path(), "Request filtered");
                    return Err(PipelineError::Filtered { stage: name.clone() });
                }
                Err(source) => {
                    return Err(PipelineError::FilterFailed {
                        stage: name.clone(),
                        source,
                    })
                }
            }
        }

        for (name, stage) in self.validators.snapshot().iter().filter(|(_, s)| s.enabled) {
            request = (stage.operation)(request).await.map_err(|source| {
                PipelineError::Validation {
                    stage: name.clone(),
                    source,
                }
            })?;
        }

        if let Some(limiter) = &self.rate_limiter {
            request = self.throttle(limiter, request)?;
        }

        for (name, stage) in self.transformers.snapshot().iter().filter(|(_, s)| s.enabled) {
            request = (stage.operation)(request).await.map_err(|source| {
                PipelineError::Transformation {
                    stage: name.clone(),
                    source,
                }
            })?;
        }

        for (name, stage) in self.enrichers.snapshot().iter().filter(|(_, s)| s.enabled) {
            request = (stage.operation)(request).await.map_err(|source| {
                PipelineError::Enrichment {
                    stage: name.clone(),
                    source,
                }
            })?;
        }

        Ok(request)
    }

    fn throttle(
        &self,
        limiter: &AdaptiveRateLimiter,
        request: GatewayRequest,
    ) -> Result<GatewayRequest, PipelineError> {
        let policy = request
            .route()
            .and_then(|r| r.rate_limit)
            .map(RateLimitPolicy::from)
            .unwrap_or_else(|| limiter.default_policy());
        let key = limiting_key(&request);
        let decision = limiter.check(&key, 1, policy);

        if !decision.allowed {
            tracing::info!(
                key = %key,
                limit = decision.limit,
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded"
            );
            return Err(PipelineError::RateLimited(decision));
        }

        Ok(request
            .with_attribute(ATTR_RATE_LIMIT_LIMIT, decision.limit.to_string())
            .with_attribute(ATTR_RATE_LIMIT_REMAINING, decision.remaining.to_string())
            .with_attribute(ATTR_RATE_LIMIT_RESET, decision.reset_at_unix_secs().to_string()))
    }
}

fn boxed<F, Fut>(stage: F) -> Arc<RequestStageFn>
where
    F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GatewayRequest, StageError>> + Send + 'static,
{
    Arc::new(move |req| stage(req).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, RouteRateLimit, TracingConfig};
    use crate::http::message::header_value;
    use crate::observability::tracer::{ExportError, ExportPayload, SpanExporter};
    use axum::http::{HeaderValue, Method, StatusCode};
    use futures_util::future::ready;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn get(path: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, path)
    }

    fn tag(name: &'static str) -> impl Fn(GatewayRequest) -> futures_util::future::Ready<Result<GatewayRequest, StageError>> {
        move |req: GatewayRequest| {
            let trail = req.attribute("trail").unwrap_or("").to_string();
            ready(Ok(req.with_attribute("trail", format!("{trail}{name},"))))
        }
    }

    #[tokio::test]
    async fn test_stage_kinds_run_in_fixed_order() {
        let pipeline = RequestPipeline::new();
        pipeline.add_enricher("e", tag("e"));
        pipeline.add_transformer("t", tag("t"));
        pipeline.add_validator("v1", tag("v1"));
        pipeline.add_validator("v2", tag("v2"));

        let out = pipeline.process(get("/")).await.unwrap();
        assert_eq!(out.attribute("trail"), Some("v1,v2,t,e,"));
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let pipeline = RequestPipeline::new();
        pipeline.add_validator("a", tag("a"));
        pipeline.add_validator("b", tag("b"));
        pipeline.add_validator("a", tag("A"));

        assert_eq!(pipeline.stage_names(StageKind::Validator), vec!["a", "b"]);
        assert_eq!(pipeline.stage_count(), 2);
        let out = pipeline.process(get("/")).await.unwrap();
        assert_eq!(out.attribute("trail"), Some("A,b,"));
    }

    #[tokio::test]
    async fn test_filter_false_stops_before_validators() {
        let validated = Arc::new(AtomicUsize::new(0));
        let pipeline = RequestPipeline::new();
        pipeline.add_filter("block_all", |_req| ready(Ok(false)));
        let counter = validated.clone();
        pipeline.add_validator("count", move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            ready(Ok(req))
        });

        let err = pipeline.process(get("/")).await.unwrap_err();
        assert_eq!(err.to_string(), "filtered by block_all");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(validated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_filter_reports_cause() {
        let pipeline = RequestPipeline::new();
        pipeline.add_filter("geo", |_req| ready(Err(StageError::new("lookup down"))));
        let err = pipeline.process(get("/")).await.unwrap_err();
        assert_eq!(err.to_string(), "filter geo failed: lookup down");
        assert_eq!(err.code(), "FILTER_ERROR");
    }

    #[tokio::test]
    async fn test_transformer_failure_stops_enrichers() {
        let pipeline = RequestPipeline::new();
        pipeline.add_transformer("rewrite", |_req| ready(Err(StageError::new("bad path"))));
        pipeline.add_enricher("e", tag("e"));

        let err = pipeline.process(get("/")).await.unwrap_err();
        assert_eq!(err.to_string(), "transformation failed at rewrite: bad path");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_disabled_and_removed_stages_are_skipped() {
        let pipeline = RequestPipeline::new();
        pipeline.add_validator("fail", |_req| ready(Err(StageError::new("no"))));
        assert!(pipeline.set_enabled(StageKind::Validator, "fail", false));
        assert!(pipeline.process(get("/")).await.is_ok());

        pipeline.add_filter("f", |_req| ready(Ok(true)));
        assert!(pipeline.remove(StageKind::Filter, "f"));
        assert!(!pipeline.remove(StageKind::Filter, "f"));

        pipeline.clear_all();
        assert_eq!(pipeline.stage_count(), 0);
    }

    #[tokio::test]
    async fn test_throttle_runs_after_validators() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            RateLimitPolicy::new(1, Duration::from_secs(60)),
            Duration::from_secs(600),
        ));
        let pipeline = RequestPipeline::new().with_rate_limiter(limiter.clone());
        pipeline.add_validator("needs_key", |req: GatewayRequest| {
            ready(if req.header("x-api-key").is_some() {
                Ok(req)
            } else {
                Err(StageError::new("missing key"))
            })
        });

        // Invalid requests do not spend budget
        for _ in 0..3 {
            assert!(pipeline.process(get("/")).await.is_err());
        }
        assert_eq!(limiter.stats().checks, 0);

        let keyed = || get("/").with_header("x-api-key", HeaderValue::from_static("tenant-a"));
        let admitted = pipeline.process(keyed()).await.unwrap();
        assert_eq!(admitted.attribute(ATTR_RATE_LIMIT_LIMIT), Some("1"));
        assert_eq!(admitted.attribute(ATTR_RATE_LIMIT_REMAINING), Some("0"));

        let err = pipeline.process(keyed()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limit exceeded");
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(err.rate_limit().map(|d| d.remaining), Some(0));
    }

    #[tokio::test]
    async fn test_route_policy_overrides_default() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            RateLimitPolicy::new(100, Duration::from_secs(60)),
            Duration::from_secs(600),
        ));
        let pipeline = RequestPipeline::new().with_rate_limiter(limiter);
        let route = Arc::new(RouteConfig {
            name: "login".into(),
            rate_limit: Some(RouteRateLimit {
                requests: 2,
                window_ms: 60_000,
            }),
            ..RouteConfig::default()
        });
        let request = || get("/login").with_route(route.clone());

        assert!(pipeline.process(request()).await.is_ok());
        assert!(pipeline.process(request()).await.is_ok());
        assert!(pipeline.process(request()).await.is_err());
    }

    #[test]
    fn test_limiting_key_identity_order() {
        let req = get("/")
            .with_header("x-real-ip", HeaderValue::from_static("10.0.0.1"))
            .with_attribute(ATTR_PRINCIPAL, "tenant-a");
        assert_eq!(limiting_key(&req), "principal=tenant-a:default");

        let req = get("/")
            .with_header("x-api-key", HeaderValue::from_static("k1"))
            .with_header("x-real-ip", HeaderValue::from_static("10.0.0.1"));
        assert_eq!(limiting_key(&req), "10.0.0.1:default");

        let route = Arc::new(RouteConfig {
            name: "meetings".into(),
            ..RouteConfig::default()
        });
        assert_eq!(limiting_key(&get("/").with_route(route)), "anonymous:meetings");
    }

    #[tokio::test]
    async fn test_rotating_api_keys_share_the_client_budget() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            RateLimitPolicy::new(100, Duration::from_secs(60)),
            Duration::from_secs(600),
        ));
        let pipeline = RequestPipeline::new().with_rate_limiter(limiter.clone());
        let route = Arc::new(RouteConfig {
            name: "meetings".into(),
            rate_limit: Some(RouteRateLimit {
                requests: 1,
                window_ms: 60_000,
            }),
            ..RouteConfig::default()
        });

        let mut admitted = 0;
        for i in 0..20 {
            let request = get("/api/v1/meetings")
                .with_peer_addr("203.0.113.7".parse().unwrap())
                .with_route(route.clone())
                .with_header("x-api-key", header_value(format!("key-{i}")).unwrap());
            if pipeline.process(request).await.is_ok() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(limiter.active_keys(), 1);
        assert_eq!(limiter.top_keys(1)[0].key, "203.0.113.7:meetings");
    }

    #[derive(Default)]
    struct NullExporter(Mutex<usize>);

    impl SpanExporter for NullExporter {
        fn export(&self, payload: ExportPayload) -> BoxFuture<'_, Result<(), ExportError>> {
            *self.0.lock().unwrap() += payload.span_count();
            Box::pin(ready(Ok(())))
        }

        fn name(&self) -> &'static str {
            "null"
        }
    }

    #[tokio::test]
    async fn test_pipeline_span_tagged_with_failing_stage() {
        let tracer = Arc::new(Tracer::new(
            &TracingConfig::default(),
            Arc::new(NullExporter::default()),
        ));
        let pipeline = RequestPipeline::new().with_tracer(tracer.clone());
        pipeline.add_validator("schema", |_req| ready(Err(StageError::new("bad body"))));

        let root = tracer.start_trace("POST /meetings", None);
        let result = pipeline.process(get("/").with_trace(root)).await;
        assert!(result.is_err());
        tracer.end_span(root.span_id);

        let spans = tracer.buffered_spans();
        let pipeline_span = spans
            .iter()
            .find(|s| s.operation_name == "request_pipeline")
            .unwrap();
        assert_eq!(pipeline_span.parent_span_id, Some(root.span_id));
        assert_eq!(pipeline_span.status, SpanStatus::Error);
        assert_eq!(
            pipeline_span.tags.get("pipeline.failed_stage"),
            Some(&TagValue::from("schema"))
        );
    }
}
