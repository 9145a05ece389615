//! In-process queue store.
//!
//! Backs single-process deployments and tests. All operations run under one
//! lock, which gives the same per-entry linearizability the Postgres store
//! gets from row locks.

use super::{JobRecord, NewEntry, QueueStats, QueueStore, Reclaimed, Retention};
use crate::error::{Error, Result};
use crate::model::{JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, Slot>,
    next_seq: u64,
}

struct Slot {
    /// FIFO tiebreak within a priority tier.
    seq: u64,
    record: JobRecord,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn slot_mut(&mut self, queue: &str, id: JobId) -> Result<&mut Slot> {
        self.entries
            .get_mut(&id)
            .filter(|s| s.record.queue == queue)
            .ok_or_else(|| Error::NotFound(format!("{queue} entry {id}")))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require_state(record: &JobRecord, allowed: &[JobState], to: JobState) -> Result<()> {
    if allowed.contains(&record.state) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: record.state.to_string(),
            to: to.to_string(),
        })
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, queue: &str, entry: NewEntry) -> Result<JobId> {
        let id = JobId::new();
        let now = Utc::now();
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq();
            inner.entries.insert(
                id,
                Slot {
                    seq,
                    record: JobRecord {
                        id,
                        queue: queue.to_string(),
                        payload: entry.payload,
                        priority: entry.priority,
                        state: JobState::Pending,
                        attempts: 0,
                        max_attempts: entry.max_attempts,
                        progress: 0,
                        progress_message: None,
                        last_error: None,
                        result: None,
                        created_at: now,
                        updated_at: now,
                        available_at: now,
                        locked_until: None,
                        finished_at: None,
                    },
                },
            );
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let locked_until = lease_expiry(now, lease);
        let mut inner = self.inner.lock();
        let next = inner
            .entries
            .values_mut()
            .filter(|s| {
                s.record.queue == queue
                    && s.record.state == JobState::Pending
                    && s.record.available_at <= now
            })
            .max_by(|a, b| {
                a.record
                    .priority
                    .cmp(&b.record.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            });
        Ok(next.map(|slot| {
            slot.record.state = JobState::Active;
            slot.record.attempts += 1;
            slot.record.locked_until = Some(locked_until);
            slot.record.updated_at = now;
            slot.record.clone()
        }))
    }

    async fn renew_lease(&self, queue: &str, id: JobId, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(queue, id)?;
        if slot.record.state != JobState::Active {
            return Ok(false);
        }
        slot.record.locked_until = Some(lease_expiry(now, lease));
        Ok(true)
    }

    async fn reclaim_stalled(&self, queue: &str, error: &str) -> Result<Reclaimed> {
        let now = Utc::now();
        let mut reclaimed = Reclaimed::default();
        {
            let mut inner = self.inner.lock();
            for slot in inner.entries.values_mut() {
                let record = &mut slot.record;
                let lapsed = record.locked_until.is_some_and(|until| until <= now);
                if record.queue != queue || record.state != JobState::Active || !lapsed {
                    continue;
                }
                record.locked_until = None;
                record.last_error = Some(error.to_string());
                record.updated_at = now;
                if record.attempts < record.max_attempts.max(1) {
                    record.state = JobState::Pending;
                    record.available_at = now;
                    reclaimed.requeued += 1;
                } else {
                    record.state = JobState::DeadLettered;
                    record.finished_at = Some(now);
                    reclaimed.dead_lettered += 1;
                }
            }
        }
        if reclaimed.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(queue, id)?;
        require_state(&slot.record, &[JobState::Active], JobState::Completed)?;
        slot.record.state = JobState::Completed;
        slot.record.locked_until = None;
        slot.record.progress = 100;
        slot.record.result = result;
        slot.record.updated_at = now;
        slot.record.finished_at = Some(now);
        Ok(())
    }

    async fn retry(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq();
            let slot = inner.slot_mut(queue, id)?;
            require_state(&slot.record, &[JobState::Active], JobState::Pending)?;
            slot.seq = seq;
            slot.record.state = JobState::Pending;
            slot.record.locked_until = None;
            slot.record.last_error = Some(error.to_string());
            slot.record.result = result;
            slot.record.available_at = available_at;
            slot.record.updated_at = Utc::now();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(queue, id)?;
        require_state(
            &slot.record,
            &[JobState::Active, JobState::Pending],
            JobState::DeadLettered,
        )?;
        slot.record.state = JobState::DeadLettered;
        slot.record.locked_until = None;
        slot.record.last_error = Some(error.to_string());
        if result.is_some() {
            slot.record.result = result;
        }
        slot.record.updated_at = now;
        slot.record.finished_at = Some(now);
        Ok(())
    }

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .get(&id)
            .filter(|s| s.record.queue == queue)
            .map(|s| s.record.clone()))
    }

    async fn list_dead(&self, queue: &str, offset: u64, limit: u64) -> Result<Vec<JobRecord>> {
        let inner = self.inner.lock();
        let mut dead: Vec<&Slot> = inner
            .entries
            .values()
            .filter(|s| s.record.queue == queue && s.record.state == JobState::DeadLettered)
            .collect();
        dead.sort_by_key(|s| (s.record.finished_at, s.seq));
        Ok(dead
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn requeue_dead(
        &self,
        queue: &str,
        id: JobId,
        max_attempts: u32,
    ) -> Result<Option<JobId>> {
        let new_id = {
            let mut inner = self.inner.lock();
            let is_dead = inner
                .entries
                .get(&id)
                .is_some_and(|s| s.record.queue == queue && s.record.state == JobState::DeadLettered);
            if !is_dead {
                return Ok(None);
            }
            let Some(old) = inner.entries.remove(&id) else {
                return Ok(None);
            };
            let now = Utc::now();
            let new_id = JobId::new();
            let seq = inner.next_seq();
            inner.entries.insert(
                new_id,
                Slot {
                    seq,
                    record: JobRecord {
                        id: new_id,
                        state: JobState::Pending,
                        attempts: 0,
                        max_attempts,
                        progress: 0,
                        progress_message: None,
                        last_error: None,
                        result: None,
                        created_at: now,
                        updated_at: now,
                        available_at: now,
                        locked_until: None,
                        finished_at: None,
                        ..old.record
                    },
                },
            );
            new_id
        };
        self.notify.notify_waiters();
        Ok(Some(new_id))
    }

    async fn clear_dead(&self, queue: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, s| !(s.record.queue == queue && s.record.state == JobState::DeadLettered));
        Ok((before - inner.entries.len()) as u64)
    }

    async fn cancel_pending(&self, queue: &str, id: JobId) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(queue, id)?;
        if slot.record.state != JobState::Pending {
            return Ok(false);
        }
        slot.record.state = JobState::Cancelled;
        slot.record.updated_at = now;
        slot.record.finished_at = Some(now);
        Ok(true)
    }

    async fn prune_finished(&self, queue: &str, retention: &Retention) -> Result<u64> {
        let now = Utc::now();
        let cutoff = retention.completed_max_age.and_then(|age| {
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| now.checked_sub_signed(age))
        });
        let mut inner = self.inner.lock();

        let mut expired = Vec::new();
        let mut finished: Vec<(Option<DateTime<Utc>>, u64, JobId)> = Vec::new();
        let mut dead: Vec<(Option<DateTime<Utc>>, u64, JobId)> = Vec::new();
        for (id, slot) in inner.entries.iter().filter(|(_, s)| s.record.queue == queue) {
            let key = (slot.record.finished_at, slot.seq, *id);
            match slot.record.state {
                JobState::Completed | JobState::Cancelled => {
                    let too_old = cutoff
                        .zip(slot.record.finished_at)
                        .is_some_and(|(cutoff, at)| at < cutoff);
                    if too_old {
                        expired.push(*id);
                    } else {
                        finished.push(key);
                    }
                }
                JobState::DeadLettered => dead.push(key),
                _ => {}
            }
        }

        let mut doomed = expired;
        for (mut group, keep) in [
            (finished, retention.keep_completed),
            (dead, retention.keep_dead),
        ] {
            // Newest first; everything past `keep` goes.
            group.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
            doomed.extend(group.into_iter().skip(keep as usize).map(|(_, _, id)| id));
        }
        for id in &doomed {
            inner.entries.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn set_progress(
        &self,
        queue: &str,
        id: JobId,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(queue, id)?;
        slot.record.progress = progress;
        slot.record.progress_message = Some(message.to_string());
        slot.record.updated_at = Utc::now();
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for slot in inner.entries.values().filter(|s| s.record.queue == queue) {
            match slot.record.state {
                JobState::Pending => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed | JobState::DeadLettered => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
