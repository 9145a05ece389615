//! Webhook delivery against a local HTTP receiver.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use buildq::error::Error;
use buildq::model::*;
use buildq::notify::*;
use buildq::queue::{JobQueue, MemoryStore, QueueStore, RetryPolicy};
use chrono::Utc;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Hit {
    attempt: Option<String>,
    secret: Option<String>,
    body: serde_json::Value,
}

/// Answers 500 to the first `fail_first` requests, 200 afterwards.
#[derive(Clone)]
struct Receiver {
    fail_first: usize,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl Receiver {
    fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

async fn hook(
    State(receiver): State<Receiver>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let count = {
        let mut hits = receiver.hits.lock().unwrap();
        hits.push(Hit {
            attempt: header(ATTEMPT_HEADER),
            secret: header(SECRET_HEADER),
            body,
        });
        hits.len()
    };
    if count <= receiver.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn spawn_receiver(fail_first: usize) -> (String, Receiver) {
    let receiver = Receiver {
        fail_first,
        hits: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), receiver)
}

fn notifier(
    store: Arc<dyn QueueStore>,
    mode: DeliveryMode,
    target: Option<WebhookTarget>,
    max_attempts: u32,
) -> WebhookNotifier {
    let queue = JobQueue::new(
        WEBHOOK_QUEUE,
        store,
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
        },
    );
    WebhookNotifier::new(
        NotifierConfig {
            mode,
            target,
            request_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
        },
        queue,
    )
    .unwrap()
}

fn success_result(job_id: JobId) -> BuildResult {
    let now = Utc::now();
    BuildResult {
        job_id,
        status: BuildStatus::Success,
        logs: vec![LogEntry::system(LogLevel::Info, "done")],
        artifacts: Vec::new(),
        test_results: None,
        metrics: BuildMetrics {
            start_time: now,
            end_time: now,
            duration_ms: 1200,
        },
        error: None,
    }
}

async fn drain_until_settled(notifier: &WebhookNotifier, id: JobId) -> JobState {
    for _ in 0..100 {
        notifier.deliver_next().await.unwrap();
        let state = notifier.queue().get(id).await.unwrap().unwrap().state;
        if state.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    panic!("delivery {id} never settled");
}

// ---------------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_delivery_posts_once() {
    let (url, receiver) = spawn_receiver(0).await;
    let notifier = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::Direct,
        None,
        3,
    );

    let mut headers = BTreeMap::new();
    headers.insert("X-Custom".to_string(), "yes".to_string());
    let id = notifier
        .deliver(&url, serde_json::json!({"hello": "world"}), headers)
        .await
        .unwrap();

    assert_eq!(id, DeliveryId::Direct);
    let hits = receiver.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].body["hello"], "world");
    assert_eq!(hits[0].attempt.as_deref(), Some("1"));
    assert_eq!(notifier.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn direct_delivery_surfaces_non_2xx() {
    let (url, receiver) = spawn_receiver(1).await;
    let notifier = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::Direct,
        None,
        3,
    );

    let err = notifier
        .deliver(&url, serde_json::json!({}), BTreeMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Webhook(_)));
    assert!(err.to_string().contains("500"));
    assert_eq!(receiver.hits().len(), 1);
}

// ---------------------------------------------------------------------------
// Durable retry mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn durable_delivery_retries_until_success() {
    let (url, receiver) = spawn_receiver(2).await;
    let notifier = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::DurableRetry,
        None,
        3,
    );

    let id = match notifier
        .deliver(&url, serde_json::json!({"n": 1}), BTreeMap::new())
        .await
        .unwrap()
    {
        DeliveryId::Queued(id) => id,
        DeliveryId::Direct => panic!("expected a queued delivery"),
    };
    assert!(receiver.hits().is_empty());

    assert_eq!(drain_until_settled(&notifier, id).await, JobState::Completed);

    let attempts: Vec<_> = receiver
        .hits()
        .into_iter()
        .map(|h| h.attempt.unwrap_or_default())
        .collect();
    assert_eq!(attempts, vec!["1", "2", "3"]);
    let stats = notifier.stats().await.unwrap();
    assert_eq!((stats.completed, stats.failed), (1, 0));
}

#[tokio::test]
async fn exhausted_delivery_leaves_build_untouched() {
    let (url, receiver) = spawn_receiver(usize::MAX).await;
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
    let builds: JobQueue<serde_json::Value> =
        JobQueue::new("builds", Arc::clone(&store), RetryPolicy::default());
    let notifier = notifier(
        Arc::clone(&store),
        DeliveryMode::DurableRetry,
        Some(WebhookTarget {
            url,
            secret: None,
        }),
        2,
    );

    let build_id = builds
        .enqueue(&serde_json::json!({"project": "chat-1"}), Priority::Normal)
        .await
        .unwrap();
    builds.dequeue().await.unwrap().unwrap();
    let result = success_result(build_id);
    builds.complete(build_id, Some(&result)).await.unwrap();

    notifier.notify_build(build_id, "chat-1", &result).await;
    let delivery = notifier.queue().dead_letters(0, 0).await.unwrap();
    assert!(delivery.is_empty());
    let pending = notifier.stats().await.unwrap();
    assert_eq!(pending.waiting, 1);

    for _ in 0..50 {
        notifier.deliver_next().await.unwrap();
        if notifier.stats().await.unwrap().failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    assert_eq!(notifier.stats().await.unwrap().failed, 1);
    assert_eq!(receiver.hits().len(), 2);
    let build = builds.get(build_id).await.unwrap().unwrap();
    assert_eq!(build.state, JobState::Completed);
    assert_eq!(builds.stats().await.unwrap().failed, 0);
}

#[tokio::test]
async fn build_report_carries_result_and_secret() {
    let (url, receiver) = spawn_receiver(0).await;
    let notifier = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::Direct,
        Some(WebhookTarget {
            url,
            secret: Some(SecretString::from("s3cret".to_string())),
        }),
        3,
    );
    let job_id = JobId::new();

    notifier
        .notify_build(job_id, "chat-7", &success_result(job_id))
        .await;

    let hits = receiver.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].secret.as_deref(), Some("s3cret"));
    let body = &hits[0].body;
    assert_eq!(body["projectId"], "chat-7");
    assert_eq!(body["jobId"], job_id.to_string());
    assert_eq!(body["status"], "success");
    assert_eq!(body["metrics"]["durationMs"], 1200);
}

#[tokio::test]
async fn missing_target_or_unreachable_endpoint_never_panics() {
    let job_id = JobId::new();
    let result = success_result(job_id);

    let no_target = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::Direct,
        None,
        3,
    );
    no_target.notify_build(job_id, "chat-1", &result).await;

    let unreachable = notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::Direct,
        Some(WebhookTarget {
            url: "http://127.0.0.1:9/hook".to_string(),
            secret: None,
        }),
        3,
    );
    unreachable.notify_build(job_id, "chat-1", &result).await;
}

#[tokio::test]
async fn delivery_workers_drain_queue_and_stop_on_cancel() {
    let (url, receiver) = spawn_receiver(0).await;
    let notifier = Arc::new(notifier(
        Arc::new(MemoryStore::new()),
        DeliveryMode::DurableRetry,
        None,
        3,
    ));
    for n in 0..3 {
        notifier
            .deliver(&url, serde_json::json!({"n": n}), BTreeMap::new())
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let handles = notifier.spawn_delivery_workers(2, cancel.clone());

    for _ in 0..100 {
        if notifier.stats().await.unwrap().completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(receiver.hits().len(), 3);
    assert_eq!(notifier.stats().await.unwrap().completed, 3);
}
