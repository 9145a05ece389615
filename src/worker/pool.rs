//! Worker pool: claims build jobs, runs the processor, retires entries.

use super::processor::BuildProcessor;
use crate::error::Result;
use crate::model::{BuildJob, BuildResult, JobId};
use crate::notify::WebhookNotifier;
use crate::progress::{ErrorEvent, ProgressEvent, ProgressHub, Topic};
use crate::queue::{FailOutcome, JobQueue};
use crate::telemetry::job::{record_state_transition, start_job_span};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of jobs processed in parallel.
    pub concurrency: usize,
    /// Poll interval fallback when no wakeup arrives.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Fixed-size pool of workers sharing one build queue.
pub struct WorkerPool {
    queue: JobQueue<BuildJob>,
    processor: Arc<BuildProcessor>,
    hub: Arc<ProgressHub>,
    notifier: Option<Arc<WebhookNotifier>>,
    config: PoolConfig,
    cancel: CancellationToken,
    active_jobs: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue<BuildJob>,
        processor: Arc<BuildProcessor>,
        hub: Arc<ProgressHub>,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            hub,
            notifier: None,
            config,
            cancel: CancellationToken::new(),
            active_jobs: AtomicUsize::new(0),
        }
    }

    /// Report terminal results (success or dead-lettered) to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Stop claiming new jobs. Jobs already running finish their attempt.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Jobs currently being executed.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Spawn `concurrency` workers.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            concurrency = self.config.concurrency,
            queue = %self.queue.name(),
            "worker pool started"
        );
        (0..self.config.concurrency.max(1))
            .map(|worker| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run_worker(worker).await })
            })
            .collect()
    }

    /// Spawn the workers and wait until every one has stopped.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        for handle in self.spawn() {
            if let Err(e) = handle.await {
                error!("worker task panicked: {e}");
            }
        }
        info!("worker pool stopped");
        Ok(())
    }

    async fn run_worker(&self, worker: usize) {
        debug!(worker, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker, "process_next error: {e}"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.wait_for_work(self.config.poll_interval) => {}
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Claim and execute one job. Returns whether a job was found.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        let id = claimed.id;
        let job = claimed.payload;
        let job_span = start_job_span(self.queue.name(), id, claimed.attempt);

        async {
            record_state_transition(&job_span, "pending", "active");
            info!(
                project_id = %job.project_id,
                attempt = claimed.attempt,
                max_attempts = claimed.max_attempts,
                "job claimed"
            );

            self.active_jobs.fetch_add(1, Ordering::Relaxed);
            let forwarder = self.forward_progress(id);
            let heartbeat = self.keep_lease(id);
            let attempt = self.processor.execute(id, &job, claimed.attempt).await;
            heartbeat.abort();
            forwarder.abort();
            self.active_jobs.fetch_sub(1, Ordering::Relaxed);

            let retryable = attempt.is_retryable();
            let result = attempt.result;

            match attempt.error {
                None => {
                    self.queue.complete(id, Some(&result)).await?;
                    record_state_transition(&job_span, "active", "completed");
                    info!(duration_ms = result.metrics.duration_ms, "job completed");
                    self.hub
                        .publish_completed(id, &job.project_id, result.clone());
                    self.notify(id, &job, &result).await;
                }
                Some(e) => {
                    let message = e.to_string();
                    record_state_transition(&job_span, "active", "failed");
                    let outcome = self
                        .queue
                        .fail(id, &message, retryable, Some(&result))
                        .await?;

                    let will_retry = matches!(outcome, FailOutcome::Retrying { .. });
                    self.hub.publish_error(ErrorEvent {
                        job_id: id,
                        project_id: job.project_id.clone(),
                        error: message.clone(),
                        attempt: claimed.attempt,
                        will_retry,
                    });

                    match outcome {
                        FailOutcome::Retrying { delay, next_attempt } => {
                            record_state_transition(&job_span, "failed", "pending");
                            warn!(
                                error = %message,
                                next_attempt,
                                delay_ms = delay.as_millis() as u64,
                                "job attempt failed, retrying"
                            );
                        }
                        FailOutcome::DeadLettered { attempts } => {
                            record_state_transition(&job_span, "failed", "dead-lettered");
                            error!(error = %message, attempts, "job dead-lettered");
                            self.hub
                                .publish_completed(id, &job.project_id, result.clone());
                            self.notify(id, &job, &result).await;
                        }
                    }
                }
            }
            Ok(true)
        }
        .instrument(job_span.clone())
        .await
    }

    async fn notify(&self, id: JobId, job: &BuildJob, result: &BuildResult) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_build(id, &job.project_id, result).await;
        }
    }

    /// Renew the claim on `id` at a third of the lease until aborted.
    fn keep_lease(&self, id: JobId) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = (queue.lease() / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.renew_lease(id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%id, "lease lost, entry is no longer active");
                        break;
                    }
                    Err(e) => debug!(%id, error = %e, "failed to renew lease"),
                }
            }
        })
    }

    /// Mirror live progress for `id` into the queue entry so status reads
    /// see it.
    fn forward_progress(&self, id: JobId) -> JoinHandle<()> {
        let mut rx = self.hub.subscribe(Topic::Job(id));
        let queue = self.queue.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let ProgressEvent::Progress(update) = event.event {
                            if let Err(e) = queue
                                .report_progress(id, update.progress, &update.message)
                                .await
                            {
                                debug!(%id, error = %e, "failed to record progress");
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%id, skipped, "progress forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
