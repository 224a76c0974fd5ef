//! PostgreSQL advisory locks for scheduled jobs
//!
//! Advisory locks belong to a session, so the lease keeps the pooled connection
//! that took the lock and unlocks on that same connection.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::warn;

use crate::error::DbResult;
use crate::repo::{JobLease, JobLockRepository};

/// PostgreSQL job lock repository
#[derive(Clone)]
pub struct PgJobLockRepository {
    pool: PgPool,
}

impl PgJobLockRepository {
    /// Create a new job lock repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLockRepository for PgJobLockRepository {
    async fn try_lock(&self, job: &str) -> DbResult<Option<Box<dyn JobLease>>> {
        let mut conn = self.pool.acquire().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(job)
            .fetch_one(&mut *conn)
            .await?;

        if !locked {
            return Ok(None);
        }

        Ok(Some(Box::new(PgJobLease {
            conn: Some(conn),
            job: job.to_string(),
        })))
    }
}

/// Session holding an advisory lock
struct PgJobLease {
    conn: Option<PoolConnection<Postgres>>,
    job: String,
}

#[async_trait]
impl JobLease for PgJobLease {
    async fn release(self: Box<Self>) -> DbResult<()> {
        let mut lease = self;
        let Some(mut conn) = lease.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&lease.job)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(job = %lease.job, "Job lock was not held at release");
                Ok(())
            }
            Err(e) => {
                conn.close_on_drop();
                Err(e.into())
            }
        }
    }
}

impl Drop for PgJobLease {
    fn drop(&mut self) {
        // Unreleased: closing the session is what frees the lock
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}
