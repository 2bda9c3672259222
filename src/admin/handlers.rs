use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::config::RouteConfig;
use crate::gateway::HealthReport;
use crate::observability::metrics::{BusinessMetrics, EnhancedStats};
use crate::security::rate_limit::{KeySnapshot, RateLimiterStats};

const DEFAULT_KEY_LIMIT: usize = 50;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct RateLimitSummary {
    pub stats: RateLimiterStats,
    pub keys: Vec<KeySnapshot>,
}

fn window(state: &AdminState, query: &WindowQuery) -> Duration {
    let secs = query
        .window_secs
        .unwrap_or(state.gateway.config().metrics.stats_window_secs);
    Duration::from_secs(secs.max(1))
}

pub async fn get_status() -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
    })
}

pub async fn get_health(State(state): State<AdminState>) -> Json<HealthReport> {
    Json(state.gateway.health())
}

pub async fn get_stats(
    State(state): State<AdminState>,
    Query(query): Query<WindowQuery>,
) -> Json<EnhancedStats> {
    Json(state.gateway.stats(window(&state, &query)))
}

pub async fn get_business(
    State(state): State<AdminState>,
    Query(query): Query<WindowQuery>,
) -> Json<BusinessMetrics> {
    Json(state.gateway.business_metrics(window(&state, &query)))
}

pub async fn get_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.gateway.export_prometheus(),
    )
}

pub async fn get_rate_limits(
    State(state): State<AdminState>,
    Query(query): Query<LimitQuery>,
) -> Json<RateLimitSummary> {
    let limiter = state.gateway.rate_limiter();
    Json(RateLimitSummary {
        stats: limiter.stats(),
        keys: state
            .gateway
            .rate_limit_keys(query.limit.unwrap_or(DEFAULT_KEY_LIMIT)),
    })
}

pub async fn get_routes(State(state): State<AdminState>) -> Json<Vec<RouteConfig>> {
    Json(
        state
            .gateway
            .routes()
            .iter()
            .map(|route| route.as_ref().clone())
            .collect(),
    )
}
