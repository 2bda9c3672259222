//! Response pipeline.
//!
//! # Data Flow
//! ```text
//! GatewayResponse (backend or gateway error)
//!     → filters      (false → return as is, e.g. protocol upgrades)
//!     → transformers (error standardization, envelope)
//!     → enrichers    (security, CORS, deprecation, timing, caching headers)
//!     → validators   (sanitizers: redaction, internal headers, ETag)
//!     → client
//! ```
//!
//! # Design Decisions
//! - Fail open: a failing or panicking stage is logged and skipped, the
//!   previous response flows on unchanged
//! - `process` never fails; the client always gets a response
//! - Bodyless statuses (101/204/304) still get header stages; body stages skip them

pub mod enrichers;
pub mod filters;
pub mod sanitizers;
pub mod transformers;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::config::RouteConfig;
use crate::http::message::{GatewayRequest, GatewayResponse};
use crate::pipeline::error::StageError;
use crate::pipeline::registry::{StageKind, StageRegistry};

/// The request a response answers, shared by every response stage.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub request: GatewayRequest,
    pub started_at: Instant,
}

impl ResponseContext {
    pub fn new(request: GatewayRequest) -> Self {
        let started_at = request.received_at();
        Self {
            request,
            started_at,
        }
    }

    pub fn route(&self) -> Option<&Arc<RouteConfig>> {
        self.request.route()
    }

    /// Id assigned by the request pipeline, else the inbound `x-request-id`.
    pub fn request_id(&self) -> Option<&str> {
        self.request
            .request_id()
            .or_else(|| self.request.header("x-request-id"))
    }
}

pub type ResponseFilterFn = dyn Fn(GatewayResponse, Arc<ResponseContext>) -> BoxFuture<'static, Result<bool, StageError>>
    + Send
    + Sync;

pub type ResponseStageFn = dyn Fn(GatewayResponse, Arc<ResponseContext>) -> BoxFuture<'static, Result<GatewayResponse, StageError>>
    + Send
    + Sync;

#[derive(Default)]
pub struct ResponsePipeline {
    filters: StageRegistry<ResponseFilterFn>,
    transformers: StageRegistry<ResponseStageFn>,
    enrichers: StageRegistry<ResponseStageFn>,
    validators: StageRegistry<ResponseStageFn>,
}

/// Run one stage, turning a panic (while building or polling its future) into a stage error.
async fn guarded<T>(
    call: impl FnOnce() -> BoxFuture<'static, Result<T, StageError>>,
) -> Result<T, StageError> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(call))
        .map_err(|_| StageError::new("stage panicked"))?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|_| StageError::new("stage panicked"))?
}

impl ResponsePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter<F, Fut>(&self, name: &str, filter: F)
    where
        F: Fn(GatewayResponse, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StageError>> + Send + 'static,
    {
        let op: Arc<ResponseFilterFn> = Arc::new(move |res, ctx| filter(res, ctx).boxed());
        self.filters.insert(name, op);
    }

    pub fn add_transformer<F, Fut>(&self, name: &str, transformer: F)
    where
        F: Fn(GatewayResponse, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayResponse, StageError>> + Send + 'static,
    {
        self.transformers.insert(name, boxed(transformer));
    }

    pub fn add_enricher<F, Fut>(&self, name: &str, enricher: F)
    where
        F: Fn(GatewayResponse, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayResponse, StageError>> + Send + 'static,
    {
        self.enrichers.insert(name, boxed(enricher));
    }

    pub fn add_validator<F, Fut>(&self, name: &str, validator: F)
    where
        F: Fn(GatewayResponse, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GatewayResponse, StageError>> + Send + 'static,
    {
        self.validators.insert(name, boxed(validator));
    }

    fn registry(&self, kind: StageKind) -> Option<&StageRegistry<ResponseStageFn>> {
        match kind {
            StageKind::Filter => None,
            StageKind::Transformer => Some(&self.transformers),
            StageKind::Enricher => Some(&self.enrichers),
            StageKind::Validator => Some(&self.validators),
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
        self.filters.len() + self.transformers.len() + self.enrichers.len() + self.validators.len()
    }

    /// Run every enabled stage. Never fails.
    pub async fn process(
        &self,
        response: GatewayResponse,
        context: Arc<ResponseContext>,
    ) -> GatewayResponse {
        for (name, stage) in self.filters.snapshot().iter().filter(|(_, s)| s.enabled) {
            let outcome = guarded(|| (stage.operation)(response.clone(), context.clone())).await;
            match outcome {
                Ok(true) => {}
                Ok(false) => return response,
                Err(e) => {
                    tracing::warn!(stage = %name, kind = "filter", error = %e, "Response stage failed, skipping");
                }
            }
        }

        let mut response = response;
        for (kind, registry) in [
            (StageKind::Transformer, &self.transformers),
            (StageKind::Enricher, &self.enrichers),
            (StageKind::Validator, &self.validators),
        ] {
            for (name, stage) in registry.snapshot().iter().filter(|(_, s)| s.enabled) {
                let input = response.clone();
                match guarded(|| (stage.operation)(input, context.clone())).await {
                    Ok(next) => response = next,
                    Err(e) => {
                        tracing::warn!(
                            stage = %name,
                            kind = %kind,
                            error = %e,
                            request_id = context.request_id().unwrap_or("-"),
                            "Response stage failed, skipping"
                        );
                    }
                }
            }
        }
        response
    }
}

fn boxed<F, Fut>(stage: F) -> Arc<ResponseStageFn>
where
    F: Fn(GatewayResponse, Arc<ResponseContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GatewayResponse, StageError>> + Send + 'static,
{
    Arc::new(move |res, ctx| stage(res, ctx).boxed())
}
