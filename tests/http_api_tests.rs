use dataset_publisher::{
    config::AppConfig, db, routes, services::outbox::ChannelOutboxSignal, state::AppState,
};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Api {
    base: String,
    http: Client,
    dir: TempDir,
}

impl Api {
    async fn start() -> Self {
        Self::start_with(1_024, 2).await
    }

    async fn start_with(chunk_size: u64, concurrency: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig {
            storage_dir: dir.path().join("objects").display().to_string(),
            chunk_size,
            concurrency,
            ..AppConfig::default()
        };
        std::fs::create_dir_all(&cfg.storage_dir).unwrap();

        let pool = Arc::new(db::connect_in_memory().await.unwrap());
        let (outbox, _rx) = ChannelOutboxSignal::new(1);
        let state = AppState::new(&cfg, pool, None, Arc::new(outbox));
        let app = routes::routes::routes().with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            http: Client::new(),
            dir,
        }
    }

    fn write_file(&self, name: &str, len: usize) -> String {
        let path = self.dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path.display().to_string()
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        (res.status(), res.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let res = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (res.status(), res.json().await.unwrap())
    }

    async fn wait_completed(&self, id: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let (_, report) = self.get(&format!("/uploads/{}", id)).await;
                if !report["completed"].is_null() {
                    return report;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upload did not complete")
    }
}

fn free_details() -> Value {
    json!({
        "title": "Traffic counts",
        "description": "Hourly counts per junction",
        "isFree": true
    })
}

#[tokio::test]
async fn upload_publish_and_remove_a_free_dataset() {
    let api = Api::start().await;
    let path = api.write_file("traffic.csv", 5_000);

    let (status, report) = api.post("/uploads", json!({ "path": path })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["fileName"], "traffic.csv");
    assert_eq!(report["resumed"], false);
    let id = report["id"].as_str().unwrap().to_string();

    let report = api.wait_completed(&id).await;
    assert_eq!(report["progress"]["uploadedBytes"], 5_000);
    assert_eq!(report["progress"]["status"], "completed");
    assert_eq!(report["completed"]["fileSize"], 5_000);

    let (status, outcome) = api
        .post(&format!("/uploads/{}/publish", id), free_details())
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["outcome"], "published");
    assert_eq!(outcome["onChain"], false);
    let dataset_id = outcome["datasetId"].as_i64().unwrap();

    // a published upload is settled and forgotten
    let (status, _) = api.get(&format!("/uploads/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, dataset) = api.get(&format!("/datasets/{}", dataset_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dataset["status"], "active");
    assert_eq!(dataset["objectName"], report["completed"]["objectName"]);

    let res = api
        .http
        .delete(format!("{}/datasets/{}", api.base, dataset_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["outcome"], "removed");

    let (status, _) = api.get(&format!("/datasets/{}", dataset_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let res = api
        .http
        .delete(format!("{}/datasets/{}", api.base, dataset_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelled_upload_is_forgotten() {
    let api = Api::start_with(1_024, 1).await;
    let path = api.write_file("sensor-dump.bin", 8 * 1024 * 1024);

    let (status, report) = api.post("/uploads", json!({ "path": path })).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = report["id"].as_str().unwrap().to_string();

    let (status, last) = api
        .post(&format!("/uploads/{}/cancel", id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last["progress"]["status"], "cancelled");
    assert_eq!(last["progress"]["uploadedBytes"], 0);

    let (status, _) = api.get(&format!("/uploads/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = api
        .post(&format!("/uploads/{}/resume", id), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // the same file can be selected again and starts from zero
    let (status, report) = api.post("/uploads", json!({ "path": path })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["resumed"], false);
}

#[tokio::test]
async fn paid_publish_without_a_ledger_is_unavailable() {
    let api = Api::start().await;
    let path = api.write_file("prices.csv", 2_000);
    let (_, report) = api.post("/uploads", json!({ "path": path })).await;
    let id = report["id"].as_str().unwrap().to_string();
    api.wait_completed(&id).await;

    let (status, body) = api
        .post(
            &format!("/uploads/{}/publish", id),
            json!({
                "title": "Prices",
                "description": "Daily close",
                "isFree": false,
                "price": "0.1"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("ledger"));
}

#[tokio::test]
async fn unknown_uploads_and_missing_files_are_not_found() {
    let api = Api::start().await;

    let (status, _) = api
        .get("/uploads/00000000-0000-0000-0000-000000000000")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let missing = api.dir.path().join("nope.csv").display().to_string();
    let (status, _) = api.post("/uploads", json!({ "path": missing })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_endpoints_report_ready() {
    let api = Api::start().await;

    let (status, body) = api.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = api.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}
