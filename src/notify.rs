//! Webhook delivery of terminal build results.
//!
//! Direct mode makes a single POST and hands any failure back to the caller.
//! Durable mode puts the delivery on its own [`JobQueue`] with an independent
//! retry budget; exhausting it is logged and goes no further. Webhook
//! failures never touch the build's own state.

use crate::error::{Error, Result};
use crate::model::{BuildResult, JobId};
use crate::queue::{FailOutcome, JobQueue, QueueStats};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue name for durable webhook deliveries.
pub const WEBHOOK_QUEUE: &str = "webhooks";
pub const SECRET_HEADER: &str = "X-Webhook-Secret";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// One outbound POST, as stored on the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryTask {
    pub url: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Direct,
    DurableRetry,
}

/// Handle for a delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryId {
    /// Delivered synchronously.
    Direct,
    /// Queued for durable delivery under this id.
    Queued(JobId),
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryId::Direct => write!(f, "direct"),
            DeliveryId::Queued(id) => write!(f, "{id}"),
        }
    }
}

/// The endpoint build results are reported to.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub url: String,
    pub secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub mode: DeliveryMode,
    pub target: Option<WebhookTarget>,
    pub request_timeout: Duration,
    /// Idle wait between empty polls of the delivery queue.
    pub poll_interval: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Direct,
            target: None,
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Terminal build report as posted to the target. The job id comes from the
/// flattened result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildWebhookPayload<'a> {
    pub project_id: &'a str,
    #[serde(flatten)]
    pub result: &'a BuildResult,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
    queue: JobQueue<WebhookDeliveryTask>,
}

impl WebhookNotifier {
    pub fn new(config: NotifierConfig, queue: JobQueue<WebhookDeliveryTask>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Webhook(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            queue,
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        self.config.mode
    }

    /// Deliver `payload` to `url` according to the configured mode.
    pub async fn deliver(
        &self,
        url: &str,
        payload: serde_json::Value,
        headers: BTreeMap<String, String>,
    ) -> Result<DeliveryId> {
        let task = WebhookDeliveryTask {
            url: url.to_string(),
            payload,
            headers,
            attempt: 1,
        };
        match self.config.mode {
            DeliveryMode::Direct => {
                self.post_once(&task).await?;
                Ok(DeliveryId::Direct)
            }
            DeliveryMode::DurableRetry => {
                let id = self.queue.enqueue(&task, Default::default()).await?;
                debug!(%id, url, "webhook queued for delivery");
                Ok(DeliveryId::Queued(id))
            }
        }
    }

    /// One POST. Anything other than 2xx, or a transport error, is a failure.
    pub async fn post_once(&self, task: &WebhookDeliveryTask) -> Result<()> {
        let mut request = self
            .client
            .post(&task.url)
            .header(ATTEMPT_HEADER, task.attempt.to_string())
            .json(&task.payload);
        for (name, value) in &task.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let outcome = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(Error::Webhook(format!(
                "{} returned status {}",
                task.url,
                response.status()
            ))),
            Err(e) => Err(Error::Webhook(format!("{}: {e}", task.url))),
        };

        metrics::webhook_deliveries().add(
            1,
            &[KeyValue::new(
                "result",
                if outcome.is_ok() { "success" } else { "failure" },
            )],
        );
        outcome
    }

    /// Report a terminal build result to the configured target. Never fails.
    pub async fn notify_build(&self, job_id: JobId, project_id: &str, result: &BuildResult) {
        let Some(target) = &self.config.target else {
            debug!(%job_id, "no webhook target configured, skipping");
            return;
        };

        let payload = match serde_json::to_value(BuildWebhookPayload {
            project_id,
            result,
        }) {
            Ok(p) => p,
            Err(e) => {
                error!(%job_id, error = %e, "failed to serialize webhook payload");
                return;
            }
        };

        let mut headers = BTreeMap::new();
        if let Some(secret) = &target.secret {
            headers.insert(
                SECRET_HEADER.to_string(),
                secret.expose_secret().to_string(),
            );
        }

        match self.deliver(&target.url, payload, headers).await {
            Ok(id) => info!(%job_id, delivery = %id, "build webhook dispatched"),
            Err(e) => warn!(%job_id, error = %e, "build webhook failed"),
        }
    }

    /// Process one queued delivery, if any. Returns whether work was found.
    pub async fn deliver_next(&self) -> Result<bool> {
        let Some(claimed) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        let mut task = claimed.payload;
        task.attempt = claimed.attempt;

        match self.post_once(&task).await {
            Ok(()) => {
                self.queue.complete::<()>(claimed.id, None).await?;
                info!(id = %claimed.id, url = %task.url, attempt = task.attempt, "webhook delivered");
            }
            Err(e) => {
                let outcome = self
                    .queue
                    .fail::<()>(claimed.id, &e.to_string(), true, None)
                    .await?;
                match outcome {
                    FailOutcome::Retrying { delay, .. } => warn!(
                        id = %claimed.id,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "webhook delivery failed, will retry"
                    ),
                    FailOutcome::DeadLettered { attempts } => error!(
                        id = %claimed.id,
                        url = %task.url,
                        attempts,
                        error = %e,
                        "webhook delivery exhausted retries"
                    ),
                }
            }
        }
        Ok(true)
    }

    /// Drain the delivery queue until `cancel` fires.
    pub async fn run_delivery_worker(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.deliver_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("webhook delivery error: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.wait_for_work(self.config.poll_interval) => {}
            }
        }
        debug!("webhook delivery worker stopped");
    }

    /// Spawn `concurrency` delivery workers.
    pub fn spawn_delivery_workers(
        self: &Arc<Self>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|_| {
                let notifier = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { notifier.run_delivery_worker(cancel).await })
            })
            .collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub fn queue(&self) -> &JobQueue<WebhookDeliveryTask> {
        &self.queue
    }
}
