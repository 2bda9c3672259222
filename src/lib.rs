//! API gateway processing core.
//!
//! Every inbound request flows through a request pipeline (filters, validators,
//! rate limiting, transformers, enrichers), is forwarded to the matched route's
//! backend, and comes back through a response pipeline. Tracing, metrics and
//! rate limiting are shared services injected into the gateway.

// Core subsystems
pub mod config;
pub mod gateway;
pub mod http;
pub mod pipeline;
pub mod routing;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::GatewayConfig;
pub use gateway::{Gateway, GatewayBuilder, GatewayError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
