//! Postgres connection pool, migrations, and health check.
//!
//! The pool backs the durable [`crate::queue::QueueStore`] implementation
//! shared by every worker process.

pub mod queue;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Channel the queue trigger notifies on.
const READY_CHANNEL: &str = "job_queue_ready";

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
    ready: Arc<Notify>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            ready: Arc::new(Notify::new()),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Forward queue NOTIFY events to waiting workers.
    ///
    /// Workers still poll on an interval, so a dropped notification only
    /// delays pickup.
    pub async fn listen(&self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(READY_CHANNEL).await?;
        let ready = Arc::clone(&self.ready);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(n) => {
                        debug!(queue = n.payload(), "notified of new work");
                        ready.notify_waiters();
                    }
                    Err(e) => {
                        warn!("PgListener error: {e}, falling back to poll");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        info!(channel = READY_CHANNEL, "listening for queue notifications");
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
