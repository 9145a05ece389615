//! Live progress fan-out.
//!
//! Subscribers join `job:<id>` or `project:<id>` topics. Every event is
//! delivered to whoever is subscribed at publish time and nobody else: there
//! is no replay buffer and a lagging subscriber drops events.

use crate::model::{BuildResult, JobId, JobState, LogEntry};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Topic {
    Job(JobId),
    Project(String),
}

impl Topic {
    fn prefix(&self) -> &'static str {
        match self {
            Topic::Job(_) => "job",
            Topic::Project(_) => "project",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Job(id) => write!(f, "job:{id}"),
            Topic::Project(id) => write!(f, "project:{id}"),
        }
    }
}

/// Phase/percentage snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub project_id: String,
    pub status: JobState,
    /// 0..=100
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub job_id: JobId,
    pub project_id: String,
    pub error: String,
    pub attempt: u32,
    /// False once the job has been dead-lettered.
    pub will_retry: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub job_id: JobId,
    pub project_id: String,
    #[serde(flatten)]
    pub entry: LogEntry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub job_id: JobId,
    pub project_id: String,
    pub result: BuildResult,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    Log(LogEvent),
    Completed(Box<CompletedEvent>),
    Error(ErrorEvent),
}

impl ProgressEvent {
    fn suffix(&self) -> &'static str {
        match self {
            ProgressEvent::Progress(_) => "progress",
            ProgressEvent::Log(_) => "log",
            ProgressEvent::Completed(_) => "completed",
            ProgressEvent::Error(_) => "error",
        }
    }

    fn data(&self) -> serde_json::Value {
        let value = match self {
            ProgressEvent::Progress(p) => serde_json::to_value(p),
            ProgressEvent::Log(l) => serde_json::to_value(l),
            ProgressEvent::Completed(c) => serde_json::to_value(c),
            ProgressEvent::Error(e) => serde_json::to_value(e),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// An event as delivered on one topic.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: Topic,
    pub event: ProgressEvent,
}

impl TopicEvent {
    /// Wire name, e.g. `job:progress` or `project:completed`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.topic.prefix(), self.event.suffix())
    }

    /// `{"event": "...", "topic": "...", "data": {...}}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "event": self.name(),
            "topic": self.topic.to_string(),
            "data": self.event.data(),
        })
    }
}

#[derive(Default)]
pub struct ProgressHub {
    topics: Mutex<HashMap<Topic, broadcast::Sender<TopicEvent>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribing also drops every other topic whose receivers are all
    /// gone, so topics for jobs that never publish again do not pile up.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<TopicEvent> {
        let mut topics = self.topics.lock();
        topics.retain(|_, tx| tx.receiver_count() > 0);
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Topics currently held, live or not yet pruned.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn publish_progress(&self, update: ProgressUpdate) {
        let (job_id, project_id) = (update.job_id, update.project_id.clone());
        self.publish(job_id, &project_id, ProgressEvent::Progress(update));
    }

    pub fn publish_log(&self, job_id: JobId, project_id: &str, entry: LogEntry) {
        self.publish(
            job_id,
            project_id,
            ProgressEvent::Log(LogEvent {
                job_id,
                project_id: project_id.to_string(),
                entry,
            }),
        );
    }

    pub fn publish_completed(&self, job_id: JobId, project_id: &str, result: BuildResult) {
        self.publish(
            job_id,
            project_id,
            ProgressEvent::Completed(Box::new(CompletedEvent {
                job_id,
                project_id: project_id.to_string(),
                result,
            })),
        );
    }

    pub fn publish_error(&self, event: ErrorEvent) {
        let (job_id, project_id) = (event.job_id, event.project_id.clone());
        self.publish(job_id, &project_id, ProgressEvent::Error(event));
    }

    /// Deliver to the job topic and the project topic. Topics nobody listens
    /// to any more are dropped.
    fn publish(&self, job_id: JobId, project_id: &str, event: ProgressEvent) {
        metrics::progress_events_published().add(1, &[KeyValue::new("event", event.suffix())]);

        let mut topics = self.topics.lock();
        for topic in [Topic::Job(job_id), Topic::Project(project_id.to_string())] {
            let Some(tx) = topics.get(&topic) else {
                continue;
            };
            if tx.receiver_count() == 0 {
                topics.remove(&topic);
                continue;
            }
            let _ = tx.send(TopicEvent {
                topic,
                event: event.clone(),
            });
        }
    }
}
