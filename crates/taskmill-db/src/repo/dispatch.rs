//! Dispatch repository: the claimable work queue.
//!
//! The two compare-and-set operations here carry the system's correctness
//! argument. `dispatch_job` guards against duplicate dispatch between
//! concurrent schedulers with a conditional update on the job row;
//! `claim` guards against double execution between racing workers with a
//! conditional update on the dispatch row. Both rely only on the WHERE
//! predicate; neither holds a lock across statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use taskmill_core::{DispatchStatus, ExecutionStatus};

use crate::{DbError, DbResult};

/// One concrete execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DispatchRecord {
    pub id: i64,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: DispatchStatus,
    pub worker_id: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

/// Everything a worker reports when an execution reaches a terminal state.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub dispatch_id: i64,
    pub job_id: i64,
    pub worker_id: String,
    pub execution: ExecutionStatus,
    /// Start of execution; becomes the log row's `run_time`.
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub log_output: String,
    pub error_message: Option<String>,
}

/// Filter for management-facing dispatch listings.
#[derive(Debug, Clone, Default)]
pub struct DispatchFilter {
    pub job_id: Option<i64>,
    pub status: Option<DispatchStatus>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait DispatchRepo: Send + Sync {
    /// Atomically dispatch a due job: conditional update of the job row
    /// (still due, not lock-held), then insert of the PENDING dispatch, in
    /// one transaction. Returns `None` when another scheduler won the window.
    async fn dispatch_job(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        lock_until: DateTime<Utc>,
    ) -> DbResult<Option<DispatchRecord>>;

    /// The oldest PENDING dispatch, if any.
    async fn oldest_pending(&self) -> DbResult<Option<DispatchRecord>>;

    /// Attempt the claim CAS. Returns whether this worker won.
    async fn claim(&self, dispatch_id: i64, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool>;

    async fn get(&self, id: i64) -> DbResult<DispatchRecord>;

    async fn list(&self, filter: DispatchFilter) -> DbResult<Vec<DispatchRecord>>;

    /// IN_PROGRESS dispatches claimed before the cutoff.
    async fn stuck_in_progress(&self, claimed_before: DateTime<Utc>)
        -> DbResult<Vec<DispatchRecord>>;

    /// Mark a stuck dispatch TIMEOUT, write its execution log, and (when
    /// `retry_count` is given) enqueue the retry row, all in one transaction.
    /// Returns false if the dispatch was no longer IN_PROGRESS.
    async fn expire(
        &self,
        dispatch_id: i64,
        now: DateTime<Utc>,
        error_message: &str,
        log_output: &str,
        retry_count: Option<i32>,
    ) -> DbResult<bool>;

    /// Record a terminal worker outcome: dispatch update, execution log
    /// insert and worker-registration update in one transaction. Returns
    /// false if the dispatch had already left IN_PROGRESS (e.g. swept).
    async fn report_result(&self, report: DispatchReport) -> DbResult<bool>;

    /// Release all IN_PROGRESS dispatches held by a worker back to PENDING.
    async fn release_for_worker(&self, worker_id: &str) -> DbResult<u64>;

    /// Drop terminal dispatches completed before the cutoff.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64>;
}

/// PostgreSQL implementation of DispatchRepo.
pub struct PgDispatchRepo {
    pool: PgPool,
}

impl PgDispatchRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchRepo for PgDispatchRepo {
    async fn dispatch_job(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        lock_until: DateTime<Utc>,
    ) -> DbResult<Option<DispatchRecord>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_run = $2, last_dispatched_at = $3, dispatch_lock_until = $4,
                updated_at = $3
            WHERE id = $1
              AND is_active
              AND next_run IS NOT NULL
              AND next_run <= $3
              AND (dispatch_lock_until IS NULL OR dispatch_lock_until < $3)
            "#,
        )
        .bind(job_id)
        .bind(next_run)
        .bind(now)
        .bind(lock_until)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let dispatch = sqlx::query_as::<_, DispatchRecord>(
            r#"
            INSERT INTO job_dispatch (job_id, status, retry_count, created_at)
            VALUES ($1, 'PENDING', 0, $2)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(dispatch))
    }

    async fn oldest_pending(&self) -> DbResult<Option<DispatchRecord>> {
        let record = sqlx::query_as::<_, DispatchRecord>(
            r#"
            SELECT * FROM job_dispatch
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn claim(&self, dispatch_id: i64, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_dispatch
            SET status = 'IN_PROGRESS', worker_id = $2, claimed_at = $3
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(dispatch_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: i64) -> DbResult<DispatchRecord> {
        let record =
            sqlx::query_as::<_, DispatchRecord>("SELECT * FROM job_dispatch WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("dispatch {id}")))?;
        Ok(record)
    }

    async fn list(&self, filter: DispatchFilter) -> DbResult<Vec<DispatchRecord>> {
        let records = sqlx::query_as::<_, DispatchRecord>(
            r#"
            SELECT * FROM job_dispatch
            WHERE ($1::bigint IS NULL OR job_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(filter.job_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn stuck_in_progress(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> DbResult<Vec<DispatchRecord>> {
        let records = sqlx::query_as::<_, DispatchRecord>(
            r#"
            SELECT * FROM job_dispatch
            WHERE status = 'IN_PROGRESS'
              AND claimed_at IS NOT NULL
              AND claimed_at < $1
            ORDER BY claimed_at
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn expire(
        &self,
        dispatch_id: i64,
        now: DateTime<Utc>,
        error_message: &str,
        log_output: &str,
        retry_count: Option<i32>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query_as::<_, DispatchRecord>(
            r#"
            UPDATE job_dispatch
            SET status = 'TIMEOUT', completed_at = $2, error_message = $3
            WHERE id = $1 AND status = 'IN_PROGRESS'
            RETURNING *
            "#,
        )
        .bind(dispatch_id)
        .bind(now)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(expired) = expired else {
            // The worker reported in the meantime; nothing to do.
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO job_execution_logs (job_id, run_time, status, log_output)
            VALUES ($1, $2, 'TIMEOUT', $3)
            "#,
        )
        .bind(expired.job_id)
        .bind(expired.claimed_at.unwrap_or(now))
        .bind(log_output)
        .execute(&mut *tx)
        .await?;

        if let Some(retry_count) = retry_count {
            sqlx::query(
                r#"
                INSERT INTO job_dispatch (job_id, status, retry_count, created_at)
                VALUES ($1, 'PENDING', $2, $3)
                "#,
            )
            .bind(expired.job_id)
            .bind(retry_count)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn report_result(&self, report: DispatchReport) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE job_dispatch
            SET status = $3, completed_at = $4, error_message = $5
            WHERE id = $1 AND worker_id = $2 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(report.dispatch_id)
        .bind(&report.worker_id)
        .bind(report.execution.dispatch_status())
        .bind(report.completed_at)
        .bind(&report.error_message)
        .execute(&mut *tx)
        .await?;

        let recorded = updated.rows_affected() == 1;
        if recorded {
            sqlx::query(
                r#"
                INSERT INTO job_execution_logs (job_id, run_time, status, log_output)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(report.job_id)
            .bind(report.started_at)
            .bind(report.execution)
            .bind(&report.log_output)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE worker_registration
            SET status = 'IDLE', current_job_id = NULL,
                jobs_processed = jobs_processed + 1, last_heartbeat = $2
            WHERE worker_id = $1
            "#,
        )
        .bind(&report.worker_id)
        .bind(report.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(recorded)
    }

    async fn release_for_worker(&self, worker_id: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_dispatch
            SET status = 'PENDING', worker_id = NULL, claimed_at = NULL
            WHERE worker_id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_dispatch
            WHERE status IN ('COMPLETED', 'FAILED', 'TIMEOUT')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
