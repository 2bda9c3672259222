//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request id, timeout, compression)
//!     → message.rs (axum request → GatewayRequest)
//!     → gateway (routing, pipelines, backend)
//!     → message.rs (GatewayResponse → axum response)
//!     → Send to client
//! ```

pub mod message;
pub mod server;

pub use message::{header_value, GatewayRequest, GatewayResponse, InvalidHeader};
pub use server::HttpServer;
