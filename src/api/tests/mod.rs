use super::*;
use crate::downloader::test_helpers::{create_test_downloader, nzb_xml};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_app() -> (Router, Arc<UsenetDownloader>, TempDir) {
    let (downloader, dir) = create_test_downloader().await;
    let downloader = Arc::new(downloader);
    let config = downloader.get_config();
    (create_router(Arc::clone(&downloader), config), downloader, dir)
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn upload(app: &Router, name: &str) -> String {
    let xml = nzb_xml(&[("data.bin", vec![("data.1@test", 400u64)])]);
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/queue?name={name}"))
            .body(Body::from(xml))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _dl, _dir) = test_app().await;
    let response = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn cors_allows_any_origin_by_default() {
    let (app, _dl, _dir) = test_app().await;
    let request = Request::builder()
        .uri("/health")
        .header("origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn uploaded_job_shows_up_in_the_queue() {
    let (app, _dl, _dir) = test_app().await;
    let id = upload(&app, "holiday").await;

    let response = send(&app, empty_request("GET", "/queue")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let queue = json_body(response).await;
    let jobs = queue.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], id.as_str());
    assert_eq!(jobs[0]["name"], "holiday");
    assert_eq!(jobs[0]["status"], "queued");

    let response = send(&app, empty_request("GET", &format!("/queue/{id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["size_bytes"], 400);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let (app, _dl, _dir) = test_app().await;
    let response = send(&app, empty_request("GET", "/queue/nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], "job_not_found");
}

#[tokio::test]
async fn broken_manifest_is_rejected() {
    let (app, _dl, _dir) = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/queue")
        .body(Body::from("<nzb><file>"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["error"]["code"], "invalid_nzb");
}

#[tokio::test]
async fn pause_and_resume_change_engine_state() {
    let (app, _dl, _dir) = test_app().await;

    let response = send(&app, empty_request("POST", "/pause")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let status = json_body(send(&app, empty_request("GET", "/status")).await).await;
    assert_eq!(status["state"], "paused");
    assert_eq!(status["pause_reason"], "operator");

    let response = send(&app, empty_request("POST", "/resume")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let status = json_body(send(&app, empty_request("GET", "/status")).await).await;
    assert_eq!(status["state"], "running");
}

#[tokio::test]
async fn priority_change_reorders_the_queue() {
    let (app, _dl, _dir) = test_app().await;
    let first = upload(&app, "first").await;
    let second = upload(&app, "second").await;

    let response = send(
        &app,
        json_request(
            "PATCH",
            &format!("/queue/{second}/priority"),
            json!({ "priority": "high" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["position"], 0);

    let queue = json_body(send(&app, empty_request("GET", "/queue")).await).await;
    assert_eq!(queue[0]["id"], second.as_str());
    assert_eq!(queue[1]["id"], first.as_str());
}

#[tokio::test]
async fn move_needs_a_target() {
    let (app, _dl, _dir) = test_app().await;
    let id = upload(&app, "lonely").await;
    let response = send(
        &app,
        json_request("POST", &format!("/queue/{id}/move"), json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_removes_the_job() {
    let (app, _dl, _dir) = test_app().await;
    let id = upload(&app, "gone").await;

    let response = send(&app, empty_request("DELETE", &format!("/queue/{id}"))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let queue = json_body(send(&app, empty_request("GET", "/queue")).await).await;
    assert!(queue.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn warnings_can_be_listed_and_cleared() {
    let (app, downloader, _dir) = test_app().await;
    downloader.warnings.warn("disk is getting full");

    let warnings = json_body(send(&app, empty_request("GET", "/warnings")).await).await;
    assert_eq!(warnings[0]["message"], "disk is getting full");

    let response = send(&app, empty_request("DELETE", "/warnings")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let warnings = json_body(send(&app, empty_request("GET", "/warnings")).await).await;
    assert!(warnings.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn history_starts_empty() {
    let (app, _dl, _dir) = test_app().await;
    let response = send(&app, empty_request("GET", "/history?limit=5000")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["items"].as_array().unwrap().is_empty());
    assert_eq!(body["limit"], 1000);

    let response = send(&app, empty_request("DELETE", "/history/missing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
