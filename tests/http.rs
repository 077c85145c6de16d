mod support;

use std::path::PathBuf;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use doc_convert::{
    config::{Config, PipelineSettings},
    router::build_router,
    state::AppState,
};
use serde_json::Value;
use support::{harness, FakeEngine, Harness, PLAIN_PDF};
use tower::ServiceExt;

const API_KEY: &str = "test-intake-key";
const BOUNDARY: &str = "----doc-convert-boundary";

fn config(upload_dir: PathBuf, max_upload_bytes: usize) -> Config {
    Config {
        port: 0,
        tls_key_path: None,
        tls_cert_path: None,
        database_path: PathBuf::from(":memory:"),
        upload_dir,
        result_dir: PathBuf::from("unused"),
        convex_url: "http://127.0.0.1:1".to_string(),
        intake_api_key: Some(API_KEY.to_string()),
        telegram_bot_token: None,
        telegram_api_base: "http://127.0.0.1:1".to_string(),
        premium_upgrade_url: None,
        converter_bin: "pdf2docx".to_string(),
        qpdf_bin: "qpdf".to_string(),
        max_upload_bytes,
        log_task_queue_timings: false,
        pipeline: PipelineSettings::default(),
    }
}

fn app(h: &Harness, max_upload_bytes: usize) -> Router {
    let config = config(h.upload_dir.path().to_path_buf(), max_upload_bytes);
    build_router(AppState::new(config, h.store.clone(), h.pipeline.clone()))
}

fn text_part(body: &mut Vec<u8>, name: &str, value: &str) {
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
            .as_bytes(),
    );
}

fn file_part(body: &mut Vec<u8>, file_name: &str, bytes: &[u8]) {
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
}

fn multipart_body(user_id: Option<&str>, file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(user_id) = user_id {
        text_part(&mut body, "user_id", user_id);
    }
    if let Some((name, bytes)) = file {
        file_part(&mut body, name, bytes);
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn submission(key: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/submissions")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_queue_depth() {
    let h = harness(FakeEngine::default());
    let response = app(&h, 1024 * 1024)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"]["queued"], 0);
}

#[tokio::test]
async fn submissions_require_the_api_key() {
    let h = harness(FakeEngine::default());
    let body = multipart_body(Some("1"), Some(("a.pdf", PLAIN_PDF)));

    let missing = app(&h, 1024 * 1024)
        .oneshot(submission(None, body.clone()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app(&h, 1024 * 1024)
        .oneshot(submission(Some("nope"), body))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn accepted_submission_returns_job_id_and_job_is_queryable() {
    let h = harness(FakeEngine::default());
    let response = app(&h, 1024 * 1024)
        .oneshot(submission(
            Some(API_KEY),
            multipart_body(Some("31"), Some(("Thesis.pdf", PLAIN_PDF))),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let response = app(&h, 1024 * 1024)
        .oneshot(
            Request::get(format!("/api/jobs/{}", job_id))
                .header("X-API-Key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "queued");
    assert_eq!(body["userId"], 31);
    assert_eq!(body["fileName"], "Thesis.pdf");
}

#[tokio::test]
async fn rejected_submission_reports_the_reason() {
    let h = harness(FakeEngine::default());
    let response = app(&h, 1024 * 1024)
        .oneshot(submission(
            Some(API_KEY),
            multipart_body(Some("32"), Some(("image.png", b"\x89PNG"))),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["reason"], "invalid_format");

    let staged = std::fs::read_dir(h.upload_dir.path()).unwrap().count();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn malformed_uploads_are_client_errors() {
    let h = harness(FakeEngine::default());

    let no_user = app(&h, 1024 * 1024)
        .oneshot(submission(
            Some(API_KEY),
            multipart_body(None, Some(("a.pdf", PLAIN_PDF))),
        ))
        .await
        .unwrap();
    assert_eq!(no_user.status(), StatusCode::BAD_REQUEST);

    let no_file = app(&h, 1024 * 1024)
        .oneshot(submission(Some(API_KEY), multipart_body(Some("5"), None)))
        .await
        .unwrap();
    assert_eq!(no_file.status(), StatusCode::BAD_REQUEST);

    let too_large = app(&h, 8)
        .oneshot(submission(
            Some(API_KEY),
            multipart_body(Some("5"), Some(("a.pdf", PLAIN_PDF))),
        ))
        .await
        .unwrap();
    assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(std::fs::read_dir(h.upload_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(FakeEngine::default());
    let response = app(&h, 1024)
        .oneshot(
            Request::get("/api/jobs/does-not-exist")
                .header("X-API-Key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_sent_before_user_id_is_staged_under_the_owner() {
    let h = harness(FakeEngine::default());
    let mut body = Vec::new();
    file_part(&mut body, "Minutes.pdf", PLAIN_PDF);
    text_part(&mut body, "user_id", "44");
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let response = app(&h, 1024 * 1024)
        .oneshot(submission(Some(API_KEY), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = json_body(response).await["jobId"]
        .as_str()
        .unwrap()
        .to_string();

    let job = h.queue.get(&job_id).await.unwrap().unwrap();
    let staged = job.input_path.file_name().unwrap().to_string_lossy().to_string();
    assert!(staged.starts_with("44_"), "staged as {}", staged);
    assert!(staged.ends_with("_Minutes.pdf"));
    assert!(job.input_path.exists());
    assert_eq!(std::fs::read_dir(h.upload_dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn unavailable_ledger_fails_closed_with_503() {
    let h = harness(FakeEngine::default());
    h.store
        .call(|conn| conn.execute_batch("DROP TABLE usage_counters"))
        .await
        .unwrap();

    let response = app(&h, 1024 * 1024)
        .oneshot(submission(
            Some(API_KEY),
            multipart_body(Some("45"), Some(("a.pdf", PLAIN_PDF))),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.queue.depth().await.unwrap().queued, 0);
    assert_eq!(std::fs::read_dir(h.upload_dir.path()).unwrap().count(), 0);
}
