//! Worker-registration repository: the fleet's liveness table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use taskmill_core::WorkerStatus;

use crate::{DbError, DbResult};

/// The liveness record of one worker process.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
    pub jobs_processed: i64,
    pub current_job_id: Option<i64>,
    pub process_id: i32,
}

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Insert a fresh registration; a conflict on worker_id is an error.
    async fn register(&self, worker: &WorkerRecord) -> DbResult<()>;
    /// Upsert a registration; used when a worker discovers its row was
    /// reaped and needs to come back.
    async fn reregister(&self, worker: &WorkerRecord) -> DbResult<()>;
    /// Refresh the heartbeat. Returns false if the row no longer exists.
    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool>;
    /// Update status and current job, refreshing the heartbeat alongside.
    /// Returns false if the row no longer exists.
    async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_job_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;
    async fn get(&self, worker_id: &str) -> DbResult<Option<WorkerRecord>>;
    async fn delete(&self, worker_id: &str) -> DbResult<()>;
    /// Delete registrations whose heartbeat is older than the cutoff,
    /// returning the reaped ids. Dispatch rows referencing them get a NULL
    /// worker_id via the foreign key.
    async fn reap_stale(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<String>>;
    /// Registrations with a heartbeat fresher than the cutoff.
    async fn active(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<WorkerRecord>>;
}

/// PostgreSQL implementation of WorkerRepo.
pub struct PgWorkerRepo {
    pool: PgPool,
}

impl PgWorkerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepo for PgWorkerRepo {
    async fn register(&self, worker: &WorkerRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO worker_registration
                (worker_id, hostname, platform, started_at, last_heartbeat,
                 status, jobs_processed, current_job_id, process_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.hostname)
        .bind(&worker.platform)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat)
        .bind(worker.status)
        .bind(worker.jobs_processed)
        .bind(worker.current_job_id)
        .bind(worker.process_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from);

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_unique_violation() => {
                Err(DbError::Duplicate(format!("worker {}", worker.worker_id)))
            }
            Err(e) => Err(e),
        }
    }

    async fn reregister(&self, worker: &WorkerRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_registration
                (worker_id, hostname, platform, started_at, last_heartbeat,
                 status, jobs_processed, current_job_id, process_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (worker_id) DO UPDATE
            SET last_heartbeat = EXCLUDED.last_heartbeat,
                status = EXCLUDED.status,
                jobs_processed = EXCLUDED.jobs_processed,
                current_job_id = EXCLUDED.current_job_id
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.hostname)
        .bind(&worker.platform)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat)
        .bind(worker.status)
        .bind(worker.jobs_processed)
        .bind(worker.current_job_id)
        .bind(worker.process_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE worker_registration SET last_heartbeat = $2 WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_job_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE worker_registration
            SET status = $2, current_job_id = $3, last_heartbeat = $4
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .bind(status)
        .bind(current_job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, worker_id: &str) -> DbResult<Option<WorkerRecord>> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM worker_registration WHERE worker_id = $1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn delete(&self, worker_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM worker_registration WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reap_stale(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<String>> {
        let reaped: Vec<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM worker_registration
            WHERE last_heartbeat < $1
            RETURNING worker_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(reaped.into_iter().map(|(id,)| id).collect())
    }

    async fn active(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<WorkerRecord>> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            r#"
            SELECT * FROM worker_registration
            WHERE last_heartbeat > $1
            ORDER BY started_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
