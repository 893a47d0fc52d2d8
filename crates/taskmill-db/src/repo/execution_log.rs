//! Execution-log repository.
//!
//! Log rows are immutable: inserted exactly once per terminal dispatch
//! outcome (by the worker's report transaction or the scheduler's timeout
//! sweep) and never updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use taskmill_core::ExecutionStatus;

use crate::DbResult;

/// One completed execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionLogRecord {
    pub id: i64,
    pub job_id: i64,
    pub run_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub log_output: String,
}

#[async_trait]
pub trait ExecutionLogRepo: Send + Sync {
    async fn insert(
        &self,
        job_id: i64,
        run_time: DateTime<Utc>,
        status: ExecutionStatus,
        log_output: &str,
    ) -> DbResult<ExecutionLogRecord>;

    /// Logs for a job, newest first.
    async fn list_for_job(&self, job_id: i64, limit: i64) -> DbResult<Vec<ExecutionLogRecord>>;
}

/// PostgreSQL implementation of ExecutionLogRepo.
pub struct PgExecutionLogRepo {
    pool: PgPool,
}

impl PgExecutionLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionLogRepo for PgExecutionLogRepo {
    async fn insert(
        &self,
        job_id: i64,
        run_time: DateTime<Utc>,
        status: ExecutionStatus,
        log_output: &str,
    ) -> DbResult<ExecutionLogRecord> {
        let record = sqlx::query_as::<_, ExecutionLogRecord>(
            r#"
            INSERT INTO job_execution_logs (job_id, run_time, status, log_output)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(run_time)
        .bind(status)
        .bind(log_output)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_for_job(&self, job_id: i64, limit: i64) -> DbResult<Vec<ExecutionLogRecord>> {
        let records = sqlx::query_as::<_, ExecutionLogRecord>(
            r#"
            SELECT * FROM job_execution_logs
            WHERE job_id = $1
            ORDER BY run_time DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
