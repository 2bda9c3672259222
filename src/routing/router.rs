//! Route lookup.
//!
//! # Responsibilities
//! - Compile route configs into matchers
//! - Look up the matching route for a request
//! - Return matched route plus path captures, or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction; reloads build a new Router and swap it in
//! - Ordered by priority, then specificity, then declaration order
//! - O(n) scan (acceptable for typical route counts)

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RouteConfig;
use crate::http::message::GatewayRequest;
use crate::routing::matcher::{Matcher, MethodMatcher, PathPatternMatcher};

#[derive(Debug)]
struct CompiledRoute {
    config: Arc<RouteConfig>,
    method: MethodMatcher,
    path: PathPatternMatcher,
}

/// A matched route and its `:param` captures.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteConfig>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Compile routes. Routes with an unparsable method are skipped with a warning;
    /// config validation rejects them before they get here.
    pub fn from_config(routes: Vec<RouteConfig>) -> Self {
        let mut compiled: Vec<CompiledRoute> = routes
            .into_iter()
            .filter_map(|config| match MethodMatcher::new(&config.method) {
                Ok(method) => Some(CompiledRoute {
                    path: PathPatternMatcher::new(&config.path),
                    method,
                    config: Arc::new(config),
                }),
                Err(e) => {
                    tracing::warn!(route = %config.name, method = %config.method, error = %e, "Skipping route with invalid method");
                    None
                }
            })
            .collect();

        // Stable sort keeps declaration order among equals
        compiled.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| b.path.specificity().cmp(&a.path.specificity()))
        });

        tracing::debug!(routes = compiled.len(), "Route table compiled");
        Self { routes: compiled }
    }

    pub fn match_request(&self, request: &GatewayRequest) -> Option<RouteMatch> {
        self.routes.iter().find_map(|r| {
            if !r.method.matches(request) {
                return None;
            }
            r.path.capture(request.path()).map(|params| RouteMatch {
                route: r.config.clone(),
                params,
            })
        })
    }

    /// Routes in match order.
    pub fn routes(&self) -> Vec<Arc<RouteConfig>> {
        self.routes.iter().map(|r| r.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
