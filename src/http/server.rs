//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router that hands every request to the gateway
//! - Wire up middleware (request id, tracing, timeout, compression)
//! - Convert between axum and gateway message types
//! - Serve until the shutdown broadcast fires

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{
    compression::CompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::gateway::{Gateway, ATTR_PROTOCOL};
use crate::http::message::{GatewayRequest, GatewayResponse};
use crate::lifecycle::Shutdown;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub max_body_bytes: usize,
    pub behind_tls: bool,
}

/// HTTP front end for the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let config = gateway.config();
        let request_timeout = Duration::from_secs(config.timeouts.request_secs);
        let state = AppState {
            max_body_bytes: config.listener.max_body_bytes,
            behind_tls: config.listener.behind_tls,
            gateway,
        };
        Self {
            router: Self::build_router(state, request_timeout),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState, request_timeout: Duration) -> Router {
        Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(state)
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::new(request_timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The configured router, for embedding or in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (request, body) = into_gateway_request(request, Some(peer.ip()), state.behind_tls);

    let response = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => state.gateway.handle(request.with_body(bytes)).await,
        Err(e) => {
            tracing::debug!(error = %e, limit = state.max_body_bytes, "Failed to read request body");
            let refused = GatewayResponse::error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("request body exceeds {} bytes", state.max_body_bytes),
            );
            state.gateway.reject(request, refused).await
        }
    };
    into_http_response(response)
}

/// Split an axum request into a body-less `GatewayRequest` and its body stream.
pub fn into_gateway_request(
    request: Request<Body>,
    peer: Option<IpAddr>,
    behind_tls: bool,
) -> (GatewayRequest, Body) {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let secure = behind_tls || parts.uri.scheme_str() == Some("https");

    let mut gateway_request = GatewayRequest::new(parts.method.clone(), path_and_query)
        .with_headers(parts.headers)
        .with_secure(secure)
        .with_attribute(ATTR_PROTOCOL, format!("{:?}", parts.version));
    if let Some(peer) = peer {
        gateway_request = gateway_request.with_peer_addr(peer);
    }
    (gateway_request, body)
}

/// Convert a gateway response back to axum.
pub fn into_http_response(response: GatewayResponse) -> Response {
    let mut http = Response::new(Body::from(response.body().clone()));
    *http.status_mut() = response.status();
    *http.headers_mut() = response.headers().clone();
    http
}
