//! Priority work queues with bounded retries and a dead-letter sink.
//!
//! [`QueueStore`] is the shared, externally consistent store every worker
//! coordinates through. [`JobQueue`] layers a typed payload and the retry
//! policy on top of one named queue in that store. The build queue and the
//! webhook delivery queue are two `JobQueue`s over the same store.
//!
//! A claim is a lease. The worker holding it renews it while the attempt
//! runs; once it lapses the entry is reclaimed by the next dequeue, so a
//! crashed worker costs one attempt rather than the job.

pub mod memory;

use crate::error::{Error, Result};
use crate::model::{JobId, JobState, Priority, validate_transition};
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A new entry to push.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
}

/// A queue entry as persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: JobState,
    /// Attempts started so far. Incremented when a worker claims the entry.
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub last_error: Option<String>,
    /// Opaque result of the most recent attempt.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    /// Lease expiry while active.
    pub locked_until: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn decode_result<R: DeserializeOwned>(&self) -> Option<R> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Aggregate counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending, including entries delayed by backoff.
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    /// Dead-lettered: failed with the retry budget exhausted.
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

/// Entries a stalled-lease sweep moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Back to pending with budget left.
    pub requeued: u64,
    /// Out of attempts.
    pub dead_lettered: u64,
}

impl Reclaimed {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.dead_lettered == 0
    }
}

/// How many finished entries a queue keeps around for status reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Newest completed or cancelled entries kept.
    pub keep_completed: u64,
    /// Completed or cancelled entries older than this go regardless of count.
    pub completed_max_age: Option<Duration>,
    /// Newest dead-lettered entries kept.
    pub keep_dead: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            completed_max_age: Some(Duration::from_secs(3600)),
            keep_dead: 500,
        }
    }
}

/// Durable, linearizable-per-entry storage for named queues.
///
/// Every state-changing operation is conditional on the entry's current
/// state, so two workers can never both own an entry.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, queue: &str, entry: NewEntry) -> Result<JobId>;

    /// Claim the highest-priority, oldest available pending entry:
    /// pending → active, attempts + 1, leased until now + `lease`.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>>;

    /// Push an active entry's lease out to now + `lease`. Returns false if
    /// the entry is no longer active.
    async fn renew_lease(&self, queue: &str, id: JobId, lease: Duration) -> Result<bool>;

    /// Active entries whose lease has lapsed go back to pending when
    /// attempts remain, otherwise to dead-lettered.
    async fn reclaim_stalled(&self, queue: &str, error: &str) -> Result<Reclaimed>;

    /// active → completed.
    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<()>;

    /// active → pending, not claimable before `available_at`.
    async fn retry(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
        available_at: DateTime<Utc>,
    ) -> Result<()>;

    /// active or pending → dead-lettered.
    async fn dead_letter(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<JobRecord>>;

    /// Dead-lettered entries, oldest first.
    async fn list_dead(&self, queue: &str, offset: u64, limit: u64) -> Result<Vec<JobRecord>>;

    /// Atomically replace a dead-lettered entry with a fresh pending one.
    /// Returns the new id, or `None` if `id` is not dead-lettered.
    async fn requeue_dead(&self, queue: &str, id: JobId, max_attempts: u32)
    -> Result<Option<JobId>>;

    /// Purge every dead-lettered entry. Returns the count removed.
    async fn clear_dead(&self, queue: &str) -> Result<u64>;

    /// pending → cancelled. Returns false if the entry is not pending.
    async fn cancel_pending(&self, queue: &str, id: JobId) -> Result<bool>;

    /// Delete finished entries beyond `retention`. Returns the count removed.
    async fn prune_finished(&self, queue: &str, retention: &Retention) -> Result<u64>;

    async fn set_progress(&self, queue: &str, id: JobId, progress: u8, message: &str)
    -> Result<()>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Resolve when new work may be available, or after `max_wait`.
    async fn wait_for_work(&self, max_wait: Duration);
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded attempts with exponential backoff, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the failure of attempt `n` (0-indexed):
    /// `min(initial · 2^n, max)`.
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

// ---------------------------------------------------------------------------
// Typed queue
// ---------------------------------------------------------------------------

/// An entry claimed by a worker. Ownership is exclusive until it is completed
/// or failed.
#[derive(Debug, Clone)]
pub struct Claimed<T> {
    pub id: JobId,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: T,
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration, next_attempt: u32 },
    DeadLettered { attempts: u32 },
}

/// Claim lease used unless [`JobQueue::with_lease`] says otherwise.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

const STALLED_ERROR: &str = "lease expired before the attempt finished";

/// A typed view over one named queue in a [`QueueStore`].
pub struct JobQueue<T> {
    name: String,
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    lease: Duration,
    retention: Retention,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            policy: self.policy,
            lease: self.lease,
            retention: self.retention,
            _payload: PhantomData,
        }
    }
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(name: impl Into<String>, store: Arc<dyn QueueStore>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            store,
            policy,
            lease: DEFAULT_LEASE,
            retention: Retention::default(),
            _payload: PhantomData,
        }
    }

    /// How long a claim holds without renewal.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub async fn enqueue(&self, payload: &T, priority: Priority) -> Result<JobId> {
        let id = self
            .store
            .push(
                &self.name,
                NewEntry {
                    payload: serde_json::to_value(payload)?,
                    priority: priority.rank(),
                    max_attempts: self.policy.max_attempts,
                },
            )
            .await?;
        self.count_op("enqueue");
        Ok(id)
    }

    /// Claim the next available entry, reclaiming stalled ones first.
    /// Entries whose payload no longer deserializes are dead-lettered and
    /// skipped.
    pub async fn dequeue(&self) -> Result<Option<Claimed<T>>> {
        self.reclaim_stalled().await?;
        loop {
            let Some(record) = self.store.claim(&self.name, self.lease).await? else {
                self.count_op("dequeue_empty");
                return Ok(None);
            };
            record_transition(JobState::Pending, JobState::Active);
            match record.decode::<T>() {
                Ok(payload) => {
                    self.count_op("dequeue");
                    return Ok(Some(Claimed {
                        id: record.id,
                        attempt: record.attempts,
                        max_attempts: record.max_attempts,
                        payload,
                    }));
                }
                Err(e) => {
                    warn!(queue = %self.name, id = %record.id, error = %e, "poison payload, dead-lettering");
                    self.store
                        .dead_letter(&self.name, record.id, &format!("undecodable payload: {e}"), None)
                        .await?;
                    record_transition(JobState::Active, JobState::DeadLettered);
                    self.prune().await;
                }
            }
        }
    }

    /// Return entries whose worker stopped renewing its lease to the queue,
    /// or dead-letter them when their attempts are used up.
    pub async fn reclaim_stalled(&self) -> Result<Reclaimed> {
        let reclaimed = self.store.reclaim_stalled(&self.name, STALLED_ERROR).await?;
        if reclaimed.is_empty() {
            return Ok(reclaimed);
        }
        let stalled = reclaimed.requeued + reclaimed.dead_lettered;
        record_transitions(JobState::Active, JobState::Failed, stalled);
        record_transitions(JobState::Failed, JobState::Pending, reclaimed.requeued);
        record_transitions(JobState::Failed, JobState::DeadLettered, reclaimed.dead_lettered);
        self.count_op("reclaim_stalled");
        warn!(
            queue = %self.name,
            requeued = reclaimed.requeued,
            dead_lettered = reclaimed.dead_lettered,
            "reclaimed stalled entries"
        );
        if reclaimed.dead_lettered > 0 {
            self.prune().await;
        }
        Ok(reclaimed)
    }

    /// Keep the claim on `id` alive. Returns false once the entry has left
    /// the active state, e.g. because the lease already lapsed.
    pub async fn renew_lease(&self, id: JobId) -> Result<bool> {
        self.store.renew_lease(&self.name, id, self.lease).await
    }

    pub async fn wait_for_work(&self, max_wait: Duration) {
        self.store.wait_for_work(max_wait).await;
    }

    pub async fn complete<R: Serialize>(&self, id: JobId, result: Option<&R>) -> Result<()> {
        validate_transition(JobState::Active, JobState::Completed)?;
        let result = result.map(serde_json::to_value).transpose()?;
        self.store.complete(&self.name, id, result).await?;
        record_transition(JobState::Active, JobState::Completed);
        self.count_op("complete");
        self.prune().await;
        Ok(())
    }

    /// Record a failed attempt: requeue with backoff while budget remains,
    /// otherwise dead-letter. Non-retryable failures dead-letter immediately.
    pub async fn fail<R: Serialize>(
        &self,
        id: JobId,
        error: &str,
        retryable: bool,
        result: Option<&R>,
    ) -> Result<FailOutcome> {
        let record = self
            .store
            .get(&self.name, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} entry {id}", self.name)))?;
        validate_transition(record.state, JobState::Failed)?;
        record_transition(JobState::Active, JobState::Failed);

        let result = result.map(serde_json::to_value).transpose()?;
        let attempts = record.attempts;
        let max_attempts = record.max_attempts.max(1);

        if !retryable || attempts >= max_attempts {
            validate_transition(JobState::Failed, JobState::DeadLettered)?;
            self.store
                .dead_letter(&self.name, id, error, result)
                .await?;
            record_transition(JobState::Failed, JobState::DeadLettered);
            self.count_op("dead_letter");
            warn!(queue = %self.name, %id, attempts, max_attempts, %error, "moved to dead-letter queue");
            self.prune().await;
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        validate_transition(JobState::Failed, JobState::Pending)?;
        let delay = self.policy.backoff(attempts.saturating_sub(1));
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store
            .retry(&self.name, id, error, result, available_at)
            .await?;
        record_transition(JobState::Failed, JobState::Pending);
        self.count_op("retry");
        info!(
            queue = %self.name,
            %id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retry scheduled"
        );
        Ok(FailOutcome::Retrying {
            delay,
            next_attempt: attempts + 1,
        })
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.store.get(&self.name, id).await
    }

    /// Page of dead-lettered entries over the inclusive index range
    /// `start..=end`.
    pub async fn dead_letters(&self, start: u64, end: u64) -> Result<Vec<JobRecord>> {
        if end < start {
            return Ok(Vec::new());
        }
        self.store
            .list_dead(&self.name, start, end - start + 1)
            .await
    }

    /// Move a dead-lettered entry back to pending under a new id with a fresh
    /// attempt budget.
    pub async fn requeue_dead(&self, id: JobId) -> Result<JobId> {
        let new_id = self
            .store
            .requeue_dead(&self.name, id, self.policy.max_attempts)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead-lettered {} entry {id}", self.name)))?;
        self.count_op("requeue_dead");
        info!(queue = %self.name, old_id = %id, %new_id, "dead-lettered entry requeued");
        Ok(new_id)
    }

    pub async fn clear_dead(&self) -> Result<u64> {
        let purged = self.store.clear_dead(&self.name).await?;
        self.count_op("clear_dead");
        info!(queue = %self.name, purged, "dead-letter queue cleared");
        Ok(purged)
    }

    /// Withdraw an entry that has not started. Returns false once a worker
    /// owns it.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        let cancelled = self.store.cancel_pending(&self.name, id).await?;
        if cancelled {
            record_transition(JobState::Pending, JobState::Cancelled);
            self.count_op("cancel");
            self.prune().await;
        }
        Ok(cancelled)
    }

    /// Apply the retention policy now. Finishing an entry does this
    /// already.
    pub async fn prune_finished(&self) -> Result<u64> {
        let removed = self.store.prune_finished(&self.name, &self.retention).await?;
        if removed > 0 {
            self.count_op("prune");
            debug!(queue = %self.name, removed, "pruned finished entries");
        }
        Ok(removed)
    }

    /// Pruning never fails the transition that triggered it.
    async fn prune(&self) {
        if let Err(e) = self.prune_finished().await {
            warn!(queue = %self.name, error = %e, "failed to prune finished entries");
        }
    }

    pub async fn report_progress(&self, id: JobId, progress: u8, message: &str) -> Result<()> {
        self.store
            .set_progress(&self.name, id, progress.min(100), message)
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats(&self.name).await
    }

    fn count_op(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn record_transition(from: JobState, to: JobState) {
    record_transitions(from, to, 1);
}

fn record_transitions(from: JobState, to: JobState, count: u64) {
    if count == 0 {
        return;
    }
    metrics::job_state_transitions().add(
        count,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
