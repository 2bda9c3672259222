//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_gateway::config::{GatewayConfig, RouteConfig};
use api_gateway::http::HttpServer;
use api_gateway::lifecycle::Shutdown;
use api_gateway::Gateway;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    routing::{any, post},
    Json, Router,
};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Requests seen by a mock backend or collector.
pub type Recorded = Arc<Mutex<Vec<Value>>>;

/// Bind a loopback listener on an ephemeral port.
pub async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a raw TCP backend that always returns `status` with a JSON body.
pub async fn start_mock_backend(status: &'static str, body: &'static str) -> SocketAddr {
    let (listener, addr) = bind_loopback().await;

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });
    addr
}

async fn echo(
    State(seen): State<Recorded>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let record = serde_json::json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });
    seen.lock().unwrap().push(record.clone());
    Json(record)
}

/// Start an axum backend that echoes each request as JSON and records it.
pub async fn start_echo_backend() -> (SocketAddr, Recorded) {
    let (listener, addr) = bind_loopback().await;
    let seen = Recorded::default();
    let app = Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .with_state(seen.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, seen)
}

async fn collect(State(seen): State<Recorded>, Json(payload): Json<Value>) -> StatusCode {
    seen.lock().unwrap().push(payload);
    StatusCode::OK
}

/// Start a trace collector that stores every posted payload.
pub async fn start_mock_collector() -> (SocketAddr, Recorded) {
    let (listener, addr) = bind_loopback().await;
    let seen = Recorded::default();
    let app = Router::new()
        .route("/v1/traces", post(collect))
        .with_state(seen.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, seen)
}

pub fn route(name: &str, path: &str, backend: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        path: path.to_string(),
        backend: format!("http://{backend}"),
        ..RouteConfig::default()
    }
}

/// A gateway serving on a loopback port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let gateway = Arc::new(Gateway::builder(config).build().unwrap());
    let (listener, addr) = bind_loopback().await;
    let shutdown = Shutdown::new();

    let server = HttpServer::new(gateway.clone());
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, stop).await;
    });

    TestGateway {
        addr,
        gateway,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
