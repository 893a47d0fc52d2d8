//! Scheduled-job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use taskmill_core::{Schedule, ScheduleKind};

use crate::{DbError, DbResult};

/// A scheduled-job row: the durable definition of a recurring or manual task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    pub script_path: String,
    pub schedule_type: ScheduleKind,
    pub interval_seconds: Option<i64>,
    pub schedule_minute: Option<i16>,
    pub schedule_time: Option<String>,
    pub schedule_day: Option<i16>,
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_lock_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// The validated schedule for this row. This is the single normalization
    /// point between raw columns and the typed arithmetic; a row that fails
    /// here was corrupted outside the API's validation.
    pub fn schedule(&self) -> taskmill_core::Result<Schedule> {
        Schedule::from_parts(
            self.schedule_type,
            self.interval_seconds,
            self.schedule_minute,
            self.schedule_time.as_deref(),
            self.schedule_day,
        )
    }
}

/// Fields for creating a job, or fully replacing one on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub script_path: String,
    pub schedule_type: ScheduleKind,
    pub interval_seconds: Option<i64>,
    pub schedule_minute: Option<i16>,
    pub schedule_time: Option<String>,
    pub schedule_day: Option<i16>,
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, job: NewJob) -> DbResult<JobRecord>;
    async fn get(&self, id: i64) -> DbResult<JobRecord>;
    /// List jobs, optionally filtered by a name substring.
    async fn list(&self, search: Option<&str>) -> DbResult<Vec<JobRecord>>;
    async fn update(&self, id: i64, job: NewJob) -> DbResult<JobRecord>;
    /// Delete a job; dispatches and execution logs cascade.
    async fn delete(&self, id: i64) -> DbResult<()>;
    /// Toggle activation. Activation passes the freshly computed `next_run`;
    /// deactivation passes `None`.
    async fn set_active(
        &self,
        id: i64,
        is_active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> DbResult<JobRecord>;
    /// "Run Now": make the job due immediately. Fails for inactive jobs.
    async fn run_now(&self, id: i64, now: DateTime<Utc>) -> DbResult<JobRecord>;
    /// Active jobs due at `now` and outside their dispatch-lock window.
    async fn due(&self, now: DateTime<Utc>) -> DbResult<Vec<JobRecord>>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: NewJob) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO scheduled_jobs
                (name, script_path, schedule_type, interval_seconds, schedule_minute,
                 schedule_time, schedule_day, is_active, next_run, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(&job.name)
        .bind(&job.script_path)
        .bind(job.schedule_type)
        .bind(job.interval_seconds)
        .bind(job.schedule_minute)
        .bind(&job.schedule_time)
        .bind(job.schedule_day)
        .bind(job.is_active)
        .bind(job.next_run)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get(&self, id: i64) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Ok(record)
    }

    async fn list(&self, search: Option<&str>) -> DbResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM scheduled_jobs
            WHERE ($1::text IS NULL OR name ILIKE '%' || $1 || '%')
            ORDER BY id
            "#,
        )
        .bind(search)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update(&self, id: i64, job: NewJob) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE scheduled_jobs
            SET name = $2, script_path = $3, schedule_type = $4, interval_seconds = $5,
                schedule_minute = $6, schedule_time = $7, schedule_day = $8,
                is_active = $9, next_run = $10, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&job.name)
        .bind(&job.script_path)
        .bind(job.schedule_type)
        .bind(job.interval_seconds)
        .bind(job.schedule_minute)
        .bind(&job.schedule_time)
        .bind(job.schedule_day)
        .bind(job.is_active)
        .bind(job.next_run)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Ok(record)
    }

    async fn delete(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn set_active(
        &self,
        id: i64,
        is_active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE scheduled_jobs
            SET is_active = $2, next_run = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(is_active)
        .bind(next_run)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Ok(record)
    }

    async fn run_now(&self, id: i64, now: DateTime<Utc>) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE scheduled_jobs
            SET next_run = $2, updated_at = NOW()
            WHERE id = $1 AND is_active
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => Ok(record),
            // Distinguish "missing" from "present but paused".
            None => match self.get(id).await {
                Ok(_) => Err(DbError::JobInactive(id)),
                Err(e) => Err(e),
            },
        }
    }

    async fn due(&self, now: DateTime<Utc>) -> DbResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM scheduled_jobs
            WHERE is_active
              AND next_run IS NOT NULL
              AND next_run <= $1
              AND (dispatch_lock_until IS NULL OR dispatch_lock_until < $1)
            ORDER BY next_run
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
