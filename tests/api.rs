use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use bytes::Bytes;
use futures::channel::mpsc::UnboundedReceiver;
use serde_json::{Value, json};
use texcompiler_api_types::{ApiErrorBody, TaskStatus, TaskStatusResponse};
use tower::ServiceExt;

use texcompiler::application::artifacts::{ArtifactStore, artifact_key, log_key};
use texcompiler::application::repos::{TaskStore, TaskTransition};
use texcompiler::application::status::StatusResolver;
use texcompiler::application::submission::SubmissionService;
use texcompiler::domain::task::TaskKey;
use texcompiler::domain::types::OutputFormat;
use texcompiler::infra::artifacts::MemoryArtifactStore;
use texcompiler::infra::http::{ApiState, build_router};
use texcompiler::infra::memory::InMemoryTaskStore;

const CHECKSUM: &str = "\"Mon, 01 Jan 2019 00:00:00 GMT\"";
const ENCODED_CHECKSUM: &str = "%22Mon%2C%2001%20Jan%202019%2000%3A00%3A00%20GMT%22";

struct Harness {
    router: Router,
    store: InMemoryTaskStore,
    artifacts: Arc<MemoryArtifactStore>,
    _dispatch: UnboundedReceiver<TaskKey>,
}

fn harness() -> Harness {
    let (store, dispatch) = InMemoryTaskStore::new();
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let task_store: Arc<dyn TaskStore> = Arc::new(store.clone());

    let state = ApiState {
        submissions: Arc::new(SubmissionService::new(task_store.clone())),
        status: Arc::new(StatusResolver::new(task_store, artifacts.clone())),
    };

    Harness {
        router: build_router(state),
        store,
        artifacts,
        _dispatch: dispatch,
    }
}

fn key() -> TaskKey {
    TaskKey::new("1902.00123", CHECKSUM, OutputFormat::Pdf).expect("key")
}

fn status_path() -> String {
    format!("/1902.00123/{ENCODED_CHECKSUM}/pdf")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, header::HeaderMap, Bytes) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    (status, headers, body)
}

fn submit_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn submission(force: bool) -> Value {
    json!({
        "source_id": "1902.00123",
        "checksum": CHECKSUM,
        "output_format": "pdf",
        "force": force,
        "owner": "1234",
    })
}

async fn complete(harness: &Harness, artifact: &'static [u8]) {
    let claimed = harness
        .store
        .claim(&key(), "test-worker", Duration::from_secs(30))
        .await
        .expect("claim")
        .expect("claimable");
    harness
        .artifacts
        .put(&artifact_key(&key()), Bytes::from_static(artifact))
        .await
        .expect("put artifact");
    harness
        .artifacts
        .put(&log_key(&key()), Bytes::from_static(b"This is pdfTeX\n"))
        .await
        .expect("put log");
    let applied = harness
        .store
        .finish(
            &claimed.claim,
            TaskTransition::Completed {
                size_bytes: artifact.len() as i64,
            },
        )
        .await
        .expect("finish");
    assert!(applied);
}

#[tokio::test]
async fn submit_accepts_and_points_at_status_resource() {
    let harness = harness();

    let (status, headers, body) = send(&harness.router, submit_request(submission(false))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers.get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some(status_path().as_str())
    );
    assert!(headers.contains_key("x-request-id"));

    let view: TaskStatusResponse = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view.status, TaskStatus::Queued);
    assert_eq!(view.task_id, format!("1902.00123/{CHECKSUM}/pdf"));
    assert_eq!(view.owner.as_deref(), Some("1234"));
    assert_eq!(view.attempt_count, 1);
}

#[tokio::test]
async fn resubmission_while_queued_conflicts_without_new_work() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;

    let (status, headers, body) = send(&harness.router, submit_request(submission(true))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        headers.get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some(status_path().as_str())
    );
    let view: TaskStatusResponse = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view.status, TaskStatus::Queued);
    assert_eq!(view.attempt_count, 1);
    assert_eq!(harness.store.len(), 1);
}

#[tokio::test]
async fn format_alias_is_accepted() {
    let harness = harness();
    let body = json!({
        "source_id": "1902.00123",
        "checksum": CHECKSUM,
        "format": "ps",
    });

    let (status, headers, _) = send(&harness.router, submit_request(body)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(
        headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|location| location.ends_with("/ps"))
    );
}

#[tokio::test]
async fn invalid_submissions_are_bad_requests() {
    let harness = harness();

    let cases = [
        (
            Request::builder()
                .method(Method::POST)
                .uri("/")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .expect("request"),
            "bad_request",
        ),
        (
            submit_request(json!({
                "source_id": "1902.00123",
                "checksum": CHECKSUM,
                "output_format": "html",
            })),
            "invalid_format",
        ),
        (
            submit_request(json!({
                "source_id": "  ",
                "checksum": CHECKSUM,
                "output_format": "pdf",
            })),
            "bad_request",
        ),
        (
            submit_request(json!({
                "source_id": "1902.00123",
                "checksum": "",
                "output_format": "pdf",
            })),
            "bad_request",
        ),
    ];

    for (request, code) in cases {
        let (status, _, body) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ApiErrorBody = serde_json::from_slice(&body).expect("error json");
        assert_eq!(error.error.code, code);
    }
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let harness = harness();

    for suffix in ["", "/content", "/log"] {
        let (status, _, body) = send(&harness.router, get(&format!("/nope/abc/pdf{suffix}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "suffix `{suffix}`");
        let error: ApiErrorBody = serde_json::from_slice(&body).expect("error json");
        assert_eq!(error.error.code, "not_found");
    }
}

#[tokio::test]
async fn content_before_completion_is_not_ready() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;

    let (status, _, body) = send(&harness.router, get(&format!("{}/content", status_path()))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    let error: ApiErrorBody = serde_json::from_slice(&body).expect("error json");
    assert_eq!(error.error.code, "not_ready");
}

#[tokio::test]
async fn completed_artifact_round_trips_through_content_endpoint() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;
    complete(&harness, b"%PDF-1.4 compiled").await;

    let (status, _, body) = send(&harness.router, get(&status_path())).await;
    assert_eq!(status, StatusCode::OK);
    let view: TaskStatusResponse = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.size_bytes, Some(17));
    assert!(view.completed_at.is_some());

    let (status, headers, body) =
        send(&harness.router, get(&format!("{}/content", status_path()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"%PDF-1.4 compiled");
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/pdf")
    );
    assert_eq!(
        headers.get(header::ETAG).and_then(|v| v.to_str().ok()),
        Some(CHECKSUM)
    );
    assert_eq!(
        headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"1902.00123.pdf\"")
    );

    let (status, headers, body) =
        send(&harness.router, get(&format!("{}/log", status_path()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"This is pdfTeX\n");
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("text/plain; charset=utf-8")
    );
}

#[tokio::test]
async fn resubmitting_a_completed_task_conflicts_unless_forced() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;
    complete(&harness, b"%PDF").await;

    let (status, _, body) = send(&harness.router, submit_request(submission(false))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let view: TaskStatusResponse = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view.status, TaskStatus::Completed);

    let (status, _, body) = send(&harness.router, submit_request(submission(true))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let view: TaskStatusResponse = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view.status, TaskStatus::Queued);
    assert_eq!(view.attempt_count, 2);
    assert_eq!(view.size_bytes, None);
}

#[tokio::test]
async fn forced_resubmission_hides_the_previous_attempt_log() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;
    complete(&harness, b"%PDF").await;
    let (status, _, _) = send(&harness.router, get(&format!("{}/log", status_path()))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&harness.router, submit_request(submission(true))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = send(&harness.router, get(&format!("{}/log", status_path()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ApiErrorBody = serde_json::from_slice(&body).expect("error json");
    assert_eq!(error.error.code, "not_found");

    let (status, _, _) =
        send(&harness.router, get(&format!("{}/content", status_path()))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn vanished_artifact_reports_artifact_missing() {
    let harness = harness();
    send(&harness.router, submit_request(submission(false))).await;
    complete(&harness, b"%PDF").await;
    harness.artifacts.remove(&artifact_key(&key()));

    let (status, _, body) = send(&harness.router, get(&status_path())).await;

    assert_eq!(status, StatusCode::OK);
    let view: Value = serde_json::from_slice(&body).expect("status json");
    assert_eq!(view["status"], "errored");
    assert_eq!(view["reason"], "artifact_missing");
}

#[tokio::test]
async fn health_reports_ok() {
    let harness = harness();

    let (status, _, body) = send(&harness.router, get("/status")).await;

    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).expect("health json");
    assert_eq!(health, json!({ "status": "ok" }));
}
