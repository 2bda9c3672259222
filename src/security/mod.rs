//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (client IP resolution, allow/deny rules)
//!     → request validators (size, content type, auth)
//!     → rate_limit.rs (adaptive per-key budget)
//!     → Pass to transformers
//! ```
//!
//! # Design Decisions
//! - Allow lists fail closed when no client IP can be resolved; deny lists fail open
//! - Rate limiting runs after validation so rejected requests never consume budget

pub mod access_control;
pub mod rate_limit;
