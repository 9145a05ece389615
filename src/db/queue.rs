//! Postgres-backed queue store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! or double-claim the same row. Every transition is a conditional UPDATE on
//! the current state; zero affected rows means the transition was illegal.

use crate::error::{Error, Result};
use crate::model::{JobId, JobState};
use crate::queue::{JobRecord, NewEntry, QueueStats, QueueStore, Reclaimed, Retention};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

const COLUMNS: &str = "id, queue_name, payload, priority, state, attempts, max_attempts, \
     progress, progress_message, last_error, result, created_at, updated_at, available_at, locked_until, \
     finished_at";

#[async_trait]
impl QueueStore for super::Db {
    async fn push(&self, queue: &str, entry: NewEntry) -> Result<JobId> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO job_queue (id, queue_name, payload, priority, state, max_attempts)
             VALUES ($1, $2, $3, $4, 'pending', $5)",
        )
        .bind(id)
        .bind(queue)
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(entry.max_attempts as i32)
        .execute(self.pool())
        .await?;
        Ok(JobId(id))
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE job_queue
             SET state = 'active', attempts = attempts + 1, updated_at = now(),
                 locked_until = now() + make_interval(secs => $2)
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE queue_name = $1 AND state = 'pending' AND available_at <= now()
                 ORDER BY priority DESC, seq ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING {COLUMNS}"
        ))
        .bind(queue)
        .bind(lease.as_secs_f64())
        .fetch_optional(self.pool())
        .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn renew_lease(&self, queue: &str, id: JobId, lease: Duration) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE job_queue SET locked_until = now() + make_interval(secs => $1)
             WHERE id = $2 AND queue_name = $3 AND state = 'active'",
        )
        .bind(lease.as_secs_f64())
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        if rows_affected == 0 && self.get(queue, id).await?.is_none() {
            return Err(Error::NotFound(format!("{queue} entry {id}")));
        }
        Ok(rows_affected == 1)
    }

    async fn reclaim_stalled(&self, queue: &str, error: &str) -> Result<Reclaimed> {
        // SET expressions see the pre-update row, so both CASEs test the
        // same attempt count.
        let states: Vec<(String,)> = sqlx::query_as(
            "UPDATE job_queue
             SET state = CASE WHEN attempts < GREATEST(max_attempts, 1)
                              THEN 'pending' ELSE 'dead-lettered' END,
                 finished_at = CASE WHEN attempts < GREATEST(max_attempts, 1)
                                    THEN NULL ELSE now() END,
                 available_at = now(), locked_until = NULL, last_error = $1, updated_at = now()
             WHERE queue_name = $2 AND state = 'active' AND locked_until <= now()
             RETURNING state",
        )
        .bind(error)
        .bind(queue)
        .fetch_all(self.pool())
        .await?;

        let mut reclaimed = Reclaimed::default();
        for (state,) in states {
            if state == JobState::Pending.as_str() {
                reclaimed.requeued += 1;
            } else {
                reclaimed.dead_lettered += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE job_queue
             SET state = 'completed', progress = 100, result = $1, locked_until = NULL,
                 updated_at = now(), finished_at = now()
             WHERE id = $2 AND queue_name = $3 AND state = 'active'",
        )
        .bind(result)
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        expect_one(rows_affected, "active", JobState::Completed)
    }

    async fn retry(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE job_queue
             SET state = 'pending', last_error = $1, result = $2, available_at = $3, locked_until = NULL,
                 seq = nextval(pg_get_serial_sequence('job_queue', 'seq')), updated_at = now()
             WHERE id = $4 AND queue_name = $5 AND state = 'active'",
        )
        .bind(error)
        .bind(result)
        .bind(available_at)
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        expect_one(rows_affected, "active", JobState::Pending)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE job_queue
             SET state = 'dead-lettered', last_error = $1, result = COALESCE($2, result),
                 locked_until = NULL, updated_at = now(), finished_at = now()
             WHERE id = $3 AND queue_name = $4 AND state IN ('active', 'pending')",
        )
        .bind(error)
        .bind(result)
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        expect_one(rows_affected, "active", JobState::DeadLettered)
    }

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM job_queue WHERE id = $1 AND queue_name = $2"
        ))
        .bind(id.0)
        .bind(queue)
        .fetch_optional(self.pool())
        .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn list_dead(&self, queue: &str, offset: u64, limit: u64) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM job_queue
             WHERE queue_name = $1 AND state = 'dead-lettered'
             ORDER BY finished_at ASC, seq ASC
             OFFSET $2 LIMIT $3"
        ))
        .bind(queue)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(JobRow::try_into_record).collect()
    }

    async fn requeue_dead(
        &self,
        queue: &str,
        id: JobId,
        max_attempts: u32,
    ) -> Result<Option<JobId>> {
        let mut tx = self.pool().begin().await?;
        let removed: Option<(serde_json::Value, i32)> = sqlx::query_as(
            "DELETE FROM job_queue
             WHERE id = $1 AND queue_name = $2 AND state = 'dead-lettered'
             RETURNING payload, priority",
        )
        .bind(id.0)
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((payload, priority)) = removed else {
            return Ok(None);
        };

        let new_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO job_queue (id, queue_name, payload, priority, state, max_attempts)
             VALUES ($1, $2, $3, $4, 'pending', $5)",
        )
        .bind(new_id)
        .bind(queue)
        .bind(payload)
        .bind(priority)
        .bind(max_attempts as i32)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(JobId(new_id)))
    }

    async fn clear_dead(&self, queue: &str) -> Result<u64> {
        let purged = sqlx::query(
            "DELETE FROM job_queue WHERE queue_name = $1 AND state = 'dead-lettered'",
        )
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(purged)
    }

    async fn cancel_pending(&self, queue: &str, id: JobId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE job_queue SET state = 'cancelled', updated_at = now(), finished_at = now()
             WHERE id = $1 AND queue_name = $2 AND state = 'pending'",
        )
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        if rows_affected == 0 && self.get(queue, id).await?.is_none() {
            return Err(Error::NotFound(format!("{queue} entry {id}")));
        }
        Ok(rows_affected == 1)
    }

    async fn prune_finished(&self, queue: &str, retention: &Retention) -> Result<u64> {
        let cutoff = retention.completed_max_age.and_then(|age| {
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age))
        });
        let removed = sqlx::query(
            "DELETE FROM job_queue WHERE id IN (
                 SELECT id FROM (
                     SELECT id, finished_at, state,
                            row_number() OVER (
                                PARTITION BY state = 'dead-lettered'
                                ORDER BY finished_at DESC, seq DESC
                            ) AS recency
                     FROM job_queue
                     WHERE queue_name = $1
                       AND state IN ('completed', 'cancelled', 'dead-lettered')
                 ) finished
                 WHERE (state = 'dead-lettered' AND recency > $2)
                    OR (state <> 'dead-lettered' AND (recency > $3 OR finished_at < $4))
             )",
        )
        .bind(queue)
        .bind(i64::try_from(retention.keep_dead).unwrap_or(i64::MAX))
        .bind(i64::try_from(retention.keep_completed).unwrap_or(i64::MAX))
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(removed)
    }

    async fn set_progress(
        &self,
        queue: &str,
        id: JobId,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue SET progress = $1, progress_message = $2, updated_at = now()
             WHERE id = $3 AND queue_name = $4",
        )
        .bind(i16::from(progress))
        .bind(message)
        .bind(id.0)
        .bind(queue)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM job_queue WHERE queue_name = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(self.pool())
        .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as u64;
            match state.parse::<JobState>()? {
                JobState::Pending => stats.waiting += count,
                JobState::Active => stats.active += count,
                JobState::Completed => stats.completed += count,
                JobState::Failed | JobState::DeadLettered => stats.failed += count,
                JobState::Cancelled => stats.cancelled += count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.ready.notified()).await;
    }
}

fn expect_one(rows_affected: u64, from: &str, to: JobState) -> Result<()> {
    if rows_affected == 0 {
        return Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: serde_json::Value,
    priority: i32,
    state: String,
    attempts: i32,
    max_attempts: i32,
    progress: i16,
    progress_message: Option<String>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: JobId(self.id),
            queue: self.queue_name,
            payload: self.payload,
            priority: self.priority,
            state: self.state.parse()?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            progress: self.progress.clamp(0, 100) as u8,
            progress_message: self.progress_message,
            last_error: self.last_error,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
            available_at: self.available_at,
            locked_until: self.locked_until,
            finished_at: self.finished_at,
        })
    }
}
