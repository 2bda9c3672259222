//! Admin API tests against a live gateway.

use std::sync::Arc;

use api_gateway::admin::{setup_admin_router, AdminState};
use api_gateway::config::{AdminConfig, GatewayConfig};
use api_gateway::Gateway;
use serde_json::Value;

mod common;

const KEY: &str = "test-admin-key";

async fn start_admin(gateway: Arc<Gateway>) -> String {
    let (listener, addr) = common::bind_loopback().await;
    let app = setup_admin_router(AdminState::new(gateway));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_admin_requires_bearer_key() {
    let gateway = Arc::new(
        Gateway::builder(GatewayConfig {
            admin: AdminConfig {
                enabled: true,
                api_key: KEY.to_string(),
                ..AdminConfig::default()
            },
            ..GatewayConfig::default()
        })
        .build()
        .unwrap(),
    );
    let base = start_admin(gateway).await;
    let client = common::client();

    let anonymous = client.get(format!("{base}/admin/health")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let wrong = client
        .get(format!("{base}/admin/health"))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let ok = client
        .get(format!("{base}/admin/health"))
        .bearer_auth(KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let health: Value = ok.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_admin_reports_traffic() {
    let (backend, _) = common::start_echo_backend().await;
    let mut config = GatewayConfig {
        routes: vec![common::route("meetings", "/api/v1/meetings", backend)],
        ..GatewayConfig::default()
    };
    config.admin.api_key = KEY.to_string();
    let gw = common::start_gateway(config).await;
    let client = common::client();

    for _ in 0..3 {
        let res = client
            .get(gw.url("/api/v1/meetings"))
            .header("x-api-key", "client-a")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
    }
    let missing = client.get(gw.url("/missing")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let base = start_admin(gw.gateway.clone()).await;
    let get = |path: &str| {
        client
            .get(format!("{base}{path}"))
            .bearer_auth(KEY)
            .send()
    };

    let stats: Value = get("/admin/stats?window_secs=60").await.unwrap().json().await.unwrap();
    assert_eq!(stats["total_requests"], 4);
    assert_eq!(stats["status_codes"]["200"], 3);
    assert_eq!(stats["status_codes"]["404"], 1);

    let business: Value = get("/admin/business").await.unwrap().json().await.unwrap();
    assert_eq!(business["total_requests"], 4);
    assert_eq!(business["error_rate"], 0.25);

    let metrics = get("/admin/metrics").await.unwrap().text().await.unwrap();
    assert!(metrics.contains("# TYPE gateway_requests_total counter"));
    assert!(metrics.contains("gateway_request_duration_seconds_bucket{le=\"+Inf\"} 4"));

    let limits: Value = get("/admin/rate-limits?limit=5").await.unwrap().json().await.unwrap();
    assert_eq!(limits["keys"][0]["key"], "127.0.0.1:meetings");
    assert_eq!(limits["keys"][0]["request_count"], 3);

    let routes: Value = get("/admin/routes").await.unwrap().json().await.unwrap();
    assert_eq!(routes[0]["name"], "meetings");

    gw.shutdown.trigger();
}
