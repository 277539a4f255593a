use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};

use stocksync_api::app::{AppServices, build_app, build_services};
use stocksync_engine::EngineConfig;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, bound to an ephemeral port.
        let services = Arc::new(build_services(EngineConfig::default()).expect("failed to build services"));
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            services,
            client: reqwest::Client::new(),
            handle,
        }
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let res = self.client.get(format!("{}{path}", self.base_url)).send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn sale(channel: &str, product: &str, quantity: i64) -> Value {
    json!({ "channel_id": channel, "product_id": product, "quantity": quantity })
}

#[tokio::test]
async fn health_reports_channels() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"], 6);
    assert_eq!(body["active_conflicts"], 0);
    assert_eq!(body["event_subscribers"], 0);
}

#[tokio::test]
async fn channel_lookup_and_errors() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.get("/channels").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 6);

    let (status, body) = srv.get("/channels/pos_retail").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["priority"], 9);

    let (status, body) = srv.get("/channels/shopify").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "CHANNEL_NOT_FOUND");

    let (status, body) = srv.post("/channels/amazon/push", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CHANNEL_READ_ONLY");
}

#[tokio::test]
async fn concurrent_updates_conflict_and_resolve_over_http() {
    let srv = TestServer::spawn().await;

    let (status, first) = srv.post("/updates", sale("pos_retail", "FLEXVOLT_9AH", 35)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["conflicts"].as_array().unwrap().len(), 0);

    let (status, second) = srv.post("/updates", sale("website", "FLEXVOLT_9AH", 32)).await;
    assert_eq!(status, StatusCode::CREATED);
    let conflicts = second["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["field"], "quantity");
    let conflict_id = conflicts[0]["id"].as_str().unwrap().to_string();

    let update_id = second["update"]["id"].as_str().unwrap();
    let (status, stored) = srv.get(&format!("/updates/{update_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["version"], 2);

    let (_, active) = srv.get("/conflicts/active").await;
    assert_eq!(active.as_array().unwrap().len(), 1);

    let (status, body) = srv
        .post(&format!("/conflicts/{conflict_id}/resolve"), json!({ "strategy": "manual" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, resolved) = srv
        .post(
            &format!("/conflicts/{conflict_id}/resolve"),
            json!({ "strategy": "last_write_wins", "resolved_by": "ops@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["resolution"]["resolved_value"], 32);
    assert_eq!(resolved["resolution"]["resolved_by"], "ops@example.com");

    let (status, body) = srv
        .post(&format!("/conflicts/{conflict_id}/resolve"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CONFLICT_ALREADY_RESOLVED");

    let (_, active) = srv.get("/conflicts/active").await;
    assert!(active.as_array().unwrap().is_empty());
    let pos = srv.services.connector("pos_retail").unwrap();
    assert_eq!(pos.sent_records().last().unwrap()["quantity"], 32);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.post("/updates", sale("website", "DCB609", -4)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, body) = srv.get("/updates/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let (status, body) = srv.get("/metrics?window=fortnight").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn inbound_sync_respects_frequency_unless_forced() {
    let srv = TestServer::spawn().await;
    let ebay = srv.services.connector("ebay").unwrap();
    for (sku, qty) in [("DCB205", json!(14)), ("DCB206", json!("lots")), ("DCB207", json!(3))] {
        let record = json!({ "ItemID": sku, "QuantityAvailable": qty });
        ebay.push_inbound(chrono::Utc::now(), record.as_object().unwrap().clone());
    }

    let (status, batch) = srv.post("/channels/ebay/sync", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["total_records"], 3);
    assert_eq!(batch["successful_records"], 2);
    assert_eq!(batch["failed_records"], 1);
    assert_eq!(batch["status"], "partial");

    let (status, body) = srv.post("/channels/ebay/sync", json!({})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "SYNC_FREQUENCY_NOT_MET");

    let (status, _) = srv.post("/channels/ebay/sync?force=true", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, batches) = srv.get("/batches?window=day&channel_id=ebay").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batches.as_array().unwrap().len(), 2);

    let (status, metrics) = srv.get("/metrics?window=day").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["system"]["total_updates"], 2);
}

#[tokio::test]
async fn maintenance_status_rejects_inbound_updates() {
    let srv = TestServer::spawn().await;

    let (status, channel) = srv
        .post("/channels/ebay/status", json!({ "status": "maintenance" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(channel["status"], "maintenance");

    let (status, body) = srv.post("/updates", sale("ebay", "DCB609", 2)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CHANNEL_INACTIVE");
}

#[tokio::test]
async fn queued_deliveries_are_visible_and_flushable() {
    let srv = TestServer::spawn().await;
    let website = srv.services.connector("website").unwrap();
    website.set_reachable(false);

    let (status, processed) = srv.post("/updates", sale("pos_retail", "DWST1", 8)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(processed["propagation"]["queued"].as_array().unwrap().contains(&json!("website")));

    let (_, queue) = srv.get("/channels/website/queue").await;
    assert_eq!(queue["depth"], 1);

    website.set_reachable(true);
    let res = srv
        .client
        .post(format!("{}/channels/website/push", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let batch: Value = res.json().await.unwrap();
    assert_eq!(batch["successful_records"], 1);
    assert_eq!(website.sent_records().len(), 1);
}

#[tokio::test]
async fn event_stream_forwards_engine_events() {
    let srv = TestServer::spawn().await;

    let mut res = srv
        .client
        .get(format!("{}/events/stream?prefix=sync.update", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (status, _) = srv.post("/updates", sale("warehouse_main", "DCS391", 40)).await;
    assert_eq!(status, StatusCode::CREATED);

    let mut received = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = res.chunk().await.unwrap() {
            received.push_str(&String::from_utf8_lossy(&chunk));
            if received.contains("event: sync.update_processed") {
                break;
            }
        }
    })
    .await;

    assert!(read.is_ok(), "no update event within timeout, got: {received}");
    assert!(received.contains("DCS391"));
}
