//! HTTP surface tests driving the router in-process.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use ara_delivery_service::broker::{MemoryBroker, QueueBroker};
use ara_delivery_service::config::Settings;
use ara_delivery_service::dispatcher::{DirectoryEntry, StaticDirectory};
use ara_delivery_service::provider::LogProvider;
use ara_delivery_service::server::{create_app, AppState};
use ara_delivery_service::store::{JobStore, MemoryJobStore, Recipient};

fn app_with(settings: Settings) -> Router {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
    let directory = StaticDirectory::new(vec![DirectoryEntry {
        recipient: Recipient {
            id: "t-1".into(),
            address: "instructor@example.com".into(),
            name: Some("Terry".into()),
        },
        roles: vec!["instructor".into()],
        groups: vec!["course-101".into()],
    }]);

    create_app(AppState::new(
        settings,
        store,
        broker,
        Arc::new(LogProvider::new()),
        Arc::new(directory),
    ))
}

fn app() -> Router {
    app_with(Settings::default())
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("X-Actor-Id", "ops")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_submit_and_read_job() {
    let app = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/jobs",
            json!({
                "recipients": { "explicit": [{ "address": "ann@example.com" }] },
                "subject": "Hello",
                "body": "World"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, get(&format!("/api/v1/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["total_count"], 1);
    assert_eq!(body["created_by"], "ops");

    let (status, body) = call(&app, get(&format!("/api/v1/jobs/{}/deliveries", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, get("/api/v1/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["waiting"], 1);
}

#[tokio::test]
async fn test_filter_submission_uses_directory() {
    let app = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/jobs",
            json!({
                "recipients": { "filter": { "role": "instructor" } },
                "template_ref": { "source": "system", "name": "announcement" },
                "variables": { "title": "Grades", "message": "Posted" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
}

#[tokio::test]
async fn test_validation_error_shape() {
    let app = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/jobs",
            json!({
                "recipients": { "explicit": [] },
                "subject": "Hello",
                "body": "World"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = app();
    let (status, body) = call(
        &app,
        get("/api/v1/jobs/00000000-0000-0000-0000-000000000001"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let app = app();
    let (_, body) = call(
        &app,
        post_json(
            "/api/v1/jobs",
            json!({
                "recipients": { "explicit": [{ "address": "ann@example.com" }] },
                "subject": "Hello",
                "body": "World"
            }),
        ),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        post_json(&format!("/api/v1/jobs/{}/cancel", job_id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["sent_count"], 0);

    let (status, _) = call(
        &app,
        post_json(&format!("/api/v1/jobs/{}/archive", job_id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_system_template_name_conflicts() {
    let app = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/templates",
            json!({
                "name": "welcome",
                "category": "account",
                "subject_pattern": "Hi",
                "body_pattern": "There"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, body) = call(&app, get("/api/v1/templates")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
}

#[tokio::test]
async fn test_template_preview() {
    let app = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/templates/preview",
            json!({
                "template_ref": { "source": "system", "name": "announcement" },
                "variables": { "title": "Exam moved", "message": "Now on Friday" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "Exam moved");
}

#[tokio::test]
async fn test_api_key_gate() {
    let mut settings = Settings::default();
    settings.api.key = Some("secret".into());
    let app = app_with(settings);

    let (status, body) = call(&app, get("/api/v1/jobs")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/api/v1/jobs")
        .header("X-API-Key", "secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // Health and metrics stay open
    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = app();
    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("ara_delivery_broker_queue_depth"));
}
