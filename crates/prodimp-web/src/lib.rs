//! Axum job surface for prodimp: upload, poll, webhook probe.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use prodimp_core::{WebhookPayload, WEBHOOK_TEST_EVENT};
use prodimp_jobs::{ImportRuntime, ImportService};
use prodimp_storage::{UploadStore, WebhookClient};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prodimp-web";

pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: ImportService,
    pub uploads: UploadStore,
    pub webhooks: Arc<WebhookClient>,
}

impl AppState {
    pub fn new(service: ImportService, uploads: UploadStore, webhooks: Arc<WebhookClient>) -> Self {
        Self {
            service,
            uploads,
            webhooks,
        }
    }

    pub fn from_runtime(runtime: &ImportRuntime) -> Self {
        Self::new(
            runtime.service.clone(),
            runtime.uploads.clone(),
            runtime.webhooks.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportAccepted {
    pub job_id: Uuid,
    pub status_url: String,
}

#[derive(Debug, Deserialize)]
struct WebhookTestRequest {
    url: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route(
            "/imports",
            post(create_import_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/imports/{job_id}", get(import_status_handler))
        .route("/webhooks/test", post(webhook_test_handler))
        .with_state(Arc::new(state))
}

/// Serves the API with the runtime from the environment, plus the job reaper.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PRODIMP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let runtime = ImportRuntime::from_env().await?;
    let mut reaper = runtime.build_reaper().await?;
    reaper.start().await?;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::from_runtime(&runtime)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    reaper.shutdown().await?;
    runtime.shutdown(Duration::from_secs(15)).await;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Product Importer API",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ["/health", "/imports", "/imports/{job_id}", "/webhooks/test"],
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn create_import_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "upload body is empty");
    }
    let stored = match state.uploads.store_upload(&body).await {
        Ok(stored) => stored,
        Err(err) => return server_error(err),
    };
    match state.service.submit(stored.path).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(ImportAccepted {
                job_id,
                status_url: format!("/imports/{job_id}"),
            }),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn import_status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.service.status(job_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "job not found"),
    }
}

async fn webhook_test_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WebhookTestRequest>,
) -> Response {
    let payload = WebhookPayload::new(
        WEBHOOK_TEST_EVENT,
        json!({"message": "This is a test webhook from Product Importer"}),
        Utc::now(),
    );
    let result = state.webhooks.probe(&request.url, &payload).await;
    Json(result).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("Server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use prodimp_jobs::ImportConfig;
    use prodimp_storage::MemoryCatalog;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_app() -> (Router, ImportRuntime, TempDir) {
        let dir = tempdir().expect("tempdir");
        let config = ImportConfig {
            upload_dir: dir.path().to_path_buf(),
            ..ImportConfig::default()
        };
        let catalog = Arc::new(MemoryCatalog::new());
        let runtime = ImportRuntime::build(config, catalog.clone(), catalog).expect("runtime");
        (app(AppState::from_runtime(&runtime)), runtime, dir)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_index_respond() {
        let (app, _runtime, _dir) = test_app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        let (status, body) = send(&app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Product Importer API");
    }

    #[tokio::test]
    async fn upload_is_accepted_and_polls_to_success() {
        let (app, _runtime, _dir) = test_app();
        let upload = Request::builder()
            .method("POST")
            .uri("/imports")
            .header("content-type", "text/csv")
            .body(Body::from("sku,name,description\nW-1,Web Widget,from http\n"))
            .unwrap();
        let (status, body) = send(&app, upload).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let accepted: ImportAccepted = serde_json::from_value(body).unwrap();
        assert_eq!(accepted.status_url, format!("/imports/{}", accepted.job_id));

        let mut snapshot = json!(null);
        for _ in 0..100 {
            let (status, body) = send(&app, get(&accepted.status_url)).await;
            assert_eq!(status, StatusCode::OK);
            snapshot = body;
            if snapshot["state"] == "succeeded" || snapshot["state"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(snapshot["state"], "succeeded", "{snapshot}");
        assert_eq!(snapshot["total_processed"], 1);
        assert_eq!(snapshot["message"], "Successfully processed 1 products");
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (app, _runtime, _dir) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/imports")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "upload body is empty");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_before_staging() {
        let (app, _runtime, dir) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/imports")
            .header("content-type", "text/csv")
            .body(Body::from(vec![b'a'; MAX_UPLOAD_BYTES + 1]))
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let staged = std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0);
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (app, _runtime, _dir) = test_app();
        let (status, _) = send(&app, get(&format!("/imports/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let resp = app.clone().oneshot(get("/imports/not-a-uuid")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_probe_reports_the_endpoint_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (app, _runtime, _dir) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/test")
            .header("content-type", "application/json")
            .body(Body::from(json!({"url": format!("{}/hook", server.uri())}).to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["status_code"], 200);
    }
}
