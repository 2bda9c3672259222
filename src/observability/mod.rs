//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway::handle
//!     → tracer (request span, pipeline spans, propagation headers)
//!     → metrics (request and error samples, lifetime counters)
//!
//! Consumers:
//!     → logging.rs (structured log events to stdout)
//!     → Admin API (stats, business metrics, Prometheus text)
//!     → Trace collector (OpenTelemetry-shaped JSON, batched)
//! ```
//!
//! # Design Decisions
//! - Tracer and collector are plain values shared through `Arc`, never globals
//! - Recording is synchronous and cheap; export and sweeps run on timers

pub mod logging;
pub mod metrics;
pub mod tracer;

pub use metrics::MetricsCollector;
pub use tracer::Tracer;
