//! REST routes driven through the router without a socket.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use buildq::model::{BuildJob, JobId};
use buildq::orchestrator::BuildOrchestrator;
use buildq::progress::ProgressHub;
use buildq::queue::{JobQueue, MemoryStore, RetryPolicy};
use buildq::server::{AppState, SharedState, build_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn test_state() -> SharedState {
    let hub = Arc::new(ProgressHub::new());
    let queue = JobQueue::new("builds", Arc::new(MemoryStore::new()), RetryPolicy::default());
    Arc::new(AppState {
        orchestrator: Arc::new(BuildOrchestrator::new(queue, Arc::clone(&hub))),
        hub,
        notifier: None,
    })
}

async fn call(state: &SharedState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => request
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = build_router(Arc::clone(state))
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(&bytes)}))
    };
    (status, json)
}

fn submission() -> Value {
    json!({
        "projectId": "chat-1",
        "files": [
            {"path": "package.json", "content": "{\"name\":\"app\",\"scripts\":{\"build\":\"vite build\"}}"},
            {"path": "index.html", "content": "<html></html>"}
        ]
    })
}

async fn submit(state: &SharedState) -> JobId {
    let (status, body) = call(state, Method::POST, "/v1/builds", Some(submission())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["buildId"].as_str().unwrap().parse().unwrap()
}

/// Claim and permanently fail the next build so it lands in the dead-letter set.
async fn dead_letter_next(state: &SharedState) -> JobId {
    let queue: &JobQueue<BuildJob> = state.orchestrator.queue();
    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue
        .fail::<Value>(claimed.id, "image pull denied", false, None)
        .await
        .unwrap();
    claimed.id
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok() {
    let state = test_state();
    let (status, body) = call(&state, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_then_fetch_build() {
    let state = test_state();
    let (status, body) = call(&state, Method::POST, "/v1/builds", Some(submission())).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["strategy"], "webcontainer");
    assert!(body["complexity"]["score"].is_number());
    assert_eq!(body["complexity"]["recommendedStrategy"], "webcontainer");

    let id = body["buildId"].as_str().unwrap();
    let (status, view) = call(&state, Method::GET, &format!("/v1/builds/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["buildId"], id);
    assert_eq!(view["projectId"], "chat-1");
    assert_eq!(view["status"], "pending");
    assert_eq!(view["progress"], 0);
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let state = test_state();

    let (status, body) = call(
        &state,
        Method::POST,
        "/v1/builds",
        Some(json!({"projectId": "p", "files": [], "callbackUrl": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = call(&state, Method::POST, "/v1/builds", Some(json!({"files": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn validation_errors_list_fields() {
    let state = test_state();
    let (status, body) = call(
        &state,
        Method::POST,
        "/v1/builds",
        Some(json!({"projectId": "", "files": []})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid request");
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["projectId", "files"]);
    let (_, stats) = call(&state, Method::GET, "/v1/queue/stats", None).await;
    assert_eq!(stats["builds"]["total"], 0);
}

#[tokio::test]
async fn unknown_or_malformed_build_id_is_not_found() {
    let state = test_state();
    let (status, _) = call(&state, Method::GET, &format!("/v1/builds/{}", JobId::new()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&state, Method::GET, "/v1/builds/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_pending_then_conflict() {
    let state = test_state();
    let id = submit(&state).await;

    let uri = format!("/v1/builds/{id}/cancel");
    let (status, body) = call(&state, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (status, body) = call(&state, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already started or finished"));
}

#[tokio::test]
async fn estimate_scores_without_queueing() {
    let state = test_state();
    let (status, body) = call(
        &state,
        Method::POST,
        "/v1/builds/estimate",
        Some(json!({
            "files": [{"path": "index.html", "content": "<html></html>"}],
            "dependencies": {"dependencies": {"puppeteer": "^21.0.0"}}
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recommendedStrategy"], "docker");
    assert_eq!(body["factors"]["hasHeavyDependencies"], true);
    let (_, stats) = call(&state, Method::GET, "/v1/queue/stats", None).await;
    assert_eq!(stats["builds"]["total"], 0);
}

// ---------------------------------------------------------------------------
// Queue administration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_stats_count_states() {
    let state = test_state();
    submit(&state).await;
    submit(&state).await;
    state.orchestrator.queue().dequeue().await.unwrap().unwrap();

    let (status, body) = call(&state, Method::GET, "/v1/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["builds"]["waiting"], 1);
    assert_eq!(body["builds"]["active"], 1);
    assert_eq!(body["builds"]["total"], 2);
    assert!(body.get("webhooks").is_none());
}

#[tokio::test]
async fn dead_letters_can_be_listed_retried_and_cleared() {
    let state = test_state();
    submit(&state).await;
    let dead = dead_letter_next(&state).await;
    submit(&state).await;
    let other = dead_letter_next(&state).await;

    let (status, list) = call(&state, Method::GET, "/v1/queue/dead-letter", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], dead.to_string());
    assert_eq!(list[0]["projectId"], "chat-1");
    assert_eq!(list[0]["error"], "image pull denied");
    assert!(list[0].get("files").is_none());

    let (_, page) = call(&state, Method::GET, "/v1/queue/dead-letter?start=1&end=1", None).await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["id"], other.to_string());

    let (status, retried) = call(
        &state,
        Method::POST,
        &format!("/v1/queue/dead-letter/{dead}/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(retried["oldId"], dead.to_string());
    let new_id: JobId = retried["newId"].as_str().unwrap().parse().unwrap();
    assert_ne!(new_id, dead);
    let (_, view) = call(&state, Method::GET, &format!("/v1/builds/{new_id}"), None).await;
    assert_eq!(view["status"], "pending");

    let (status, _) = call(
        &state,
        Method::POST,
        &format!("/v1/queue/dead-letter/{new_id}/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, cleared) = call(&state, Method::DELETE, "/v1/queue/dead-letter", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["purged"], 1);
    let (_, list) = call(&state, Method::GET, "/v1/queue/dead-letter", None).await;
    assert!(list.as_array().unwrap().is_empty());
}
