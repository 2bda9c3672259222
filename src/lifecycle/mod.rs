//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build gateway → Start background tasks → Bind listeners
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Stop accepting → Drain in-flight requests
//!     → Stop background tasks (tasks.rs) → Final trace flush → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core services, then listeners
//! - Ordered shutdown: stop accept, drain, stop timers, flush
//! - One broadcast channel fans shutdown out to every task

pub mod shutdown;
pub mod signals;
pub mod tasks;

pub use shutdown::Shutdown;
pub use tasks::BackgroundTasks;
