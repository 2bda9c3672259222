//! Request/response middleware pipelines.
//!
//! # Data Flow
//! ```text
//! GatewayRequest → request::RequestPipeline → backend
//!                                              ↓
//! client ← response::ResponsePipeline ← GatewayResponse
//! ```
//!
//! # Design Decisions
//! - Stages are async closures registered by name in copy-on-write registries
//! - Request side fails fast, response side fails open
//! - Rate limiter and tracer are injected, never looked up globally

pub mod error;
pub mod registry;
pub mod request;
pub mod response;

pub use error::{PipelineError, StageError};
pub use registry::StageKind;
pub use request::RequestPipeline;
pub use response::{ResponseContext, ResponsePipeline};
