//! Admin API served on its own listener.
//!
//! # Responsibilities
//! - Expose health, statistics, Prometheus metrics and rate limiter state
//! - Show the live route table
//! - Require the configured bearer key on every endpoint

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::gateway::Gateway;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let api_key = gateway.config().admin.api_key.as_str().into();
        Self { gateway, api_key }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/health", get(get_health))
        .route("/admin/stats", get(get_stats))
        .route("/admin/business", get(get_business))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/rate-limits", get(get_rate_limits))
        .route("/admin/routes", get(get_routes))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
