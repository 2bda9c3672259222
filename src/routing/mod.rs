//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! GatewayRequest (method, path)
//!     → router.rs (ordered route scan)
//!     → matcher.rs (method + path pattern)
//!     → Return: RouteMatch (route + captures) or None
//!
//! Route Compilation (startup and hot reload):
//!     RouteConfig[]
//!     → Compile matchers
//!     → Sort by priority, then specificity
//!     → Freeze as immutable Router, swapped in atomically
//! ```
//!
//! # Design Decisions
//! - No regex in hot path
//! - Deterministic: same input always matches same route
//! - First match wins

pub mod matcher;
pub mod router;

pub use router::{RouteMatch, Router};
