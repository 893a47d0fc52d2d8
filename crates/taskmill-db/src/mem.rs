//! In-memory store implementing every repository trait.
//!
//! Mirrors the SQL semantics closely enough to exercise the coordination
//! protocol (the dispatch CAS, the claim CAS, sweep and reaper behavior)
//! without a database. Used by the scheduler and worker test suites.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskmill_core::{DispatchStatus, ExecutionStatus, WorkerStatus};

use crate::repo::{
    DispatchFilter, DispatchRecord, DispatchReport, DispatchRepo, ExecutionLogRecord,
    ExecutionLogRepo, JobRecord, JobRepo, NewJob, WorkerRecord, WorkerRepo,
};
use crate::{DbError, DbResult};

/// An in-memory coordination store.
#[derive(Default)]
pub struct MemStore {
    jobs: Mutex<Vec<JobRecord>>,
    dispatches: Mutex<Vec<DispatchRecord>>,
    workers: Mutex<Vec<WorkerRecord>>,
    logs: Mutex<Vec<ExecutionLogRecord>>,
    next_job_id: AtomicI64,
    next_dispatch_id: AtomicI64,
    next_log_id: AtomicI64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Snapshot of all dispatch rows, for assertions.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().unwrap().clone()
    }

    /// Snapshot of all execution-log rows, for assertions.
    pub fn logs(&self) -> Vec<ExecutionLogRecord> {
        self.logs.lock().unwrap().clone()
    }

    /// Snapshot of all worker rows, for assertions.
    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.workers.lock().unwrap().clone()
    }

    fn push_log(
        &self,
        job_id: i64,
        run_time: DateTime<Utc>,
        status: ExecutionStatus,
        log_output: &str,
    ) -> ExecutionLogRecord {
        let record = ExecutionLogRecord {
            id: Self::next_id(&self.next_log_id),
            job_id,
            run_time,
            status,
            log_output: log_output.to_string(),
        };
        self.logs.lock().unwrap().push(record.clone());
        record
    }
}

#[async_trait]
impl JobRepo for MemStore {
    async fn create(&self, job: NewJob) -> DbResult<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            id: Self::next_id(&self.next_job_id),
            name: job.name,
            script_path: job.script_path,
            schedule_type: job.schedule_type,
            interval_seconds: job.interval_seconds,
            schedule_minute: job.schedule_minute,
            schedule_time: job.schedule_time,
            schedule_day: job.schedule_day,
            is_active: job.is_active,
            next_run: job.next_run,
            last_dispatched_at: None,
            dispatch_lock_until: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> DbResult<JobRecord> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn list(&self, search: Option<&str>) -> DbResult<Vec<JobRecord>> {
        let jobs = self.jobs.lock().unwrap();
        let needle = search.map(str::to_lowercase);
        let mut out: Vec<_> = jobs
            .iter()
            .filter(|j| {
                needle
                    .as_deref()
                    .map(|n| j.name.to_lowercase().contains(n))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by_key(|j| j.id);
        Ok(out)
    }

    async fn update(&self, id: i64, job: NewJob) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        record.name = job.name;
        record.script_path = job.script_path;
        record.schedule_type = job.schedule_type;
        record.interval_seconds = job.interval_seconds;
        record.schedule_minute = job.schedule_minute;
        record.schedule_time = job.schedule_time;
        record.schedule_day = job.schedule_day;
        record.is_active = job.is_active;
        record.next_run = job.next_run;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: i64) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(DbError::NotFound(format!("job {id}")));
        }
        // Cascade, as the schema does.
        self.dispatches.lock().unwrap().retain(|d| d.job_id != id);
        self.logs.lock().unwrap().retain(|l| l.job_id != id);
        Ok(())
    }

    async fn set_active(
        &self,
        id: i64,
        is_active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        record.is_active = is_active;
        record.next_run = next_run;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn run_now(&self, id: i64, now: DateTime<Utc>) -> DbResult<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        if !record.is_active {
            return Err(DbError::JobInactive(id));
        }
        record.next_run = Some(now);
        Ok(record.clone())
    }

    async fn due(&self, now: DateTime<Utc>) -> DbResult<Vec<JobRecord>> {
        let jobs = self.jobs.lock().unwrap();
        let mut due: Vec<_> = jobs
            .iter()
            .filter(|j| {
                j.is_active
                    && j.next_run.is_some_and(|t| t <= now)
                    && j.dispatch_lock_until.map(|t| t < now).unwrap_or(true)
            })
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run);
        Ok(due)
    }
}

#[async_trait]
impl DispatchRepo for MemStore {
    async fn dispatch_job(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        lock_until: DateTime<Utc>,
    ) -> DbResult<Option<DispatchRecord>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.is_active
                && j.next_run.is_some_and(|t| t <= now)
                && j.dispatch_lock_until.map(|t| t < now).unwrap_or(true)
        }) else {
            return Ok(None);
        };
        job.next_run = next_run;
        job.last_dispatched_at = Some(now);
        job.dispatch_lock_until = Some(lock_until);
        job.updated_at = now;

        let dispatch = DispatchRecord {
            id: Self::next_id(&self.next_dispatch_id),
            job_id,
            created_at: now,
            claimed_at: None,
            completed_at: None,
            status: DispatchStatus::Pending,
            worker_id: None,
            retry_count: 0,
            error_message: None,
        };
        self.dispatches.lock().unwrap().push(dispatch.clone());
        Ok(Some(dispatch))
    }

    async fn oldest_pending(&self) -> DbResult<Option<DispatchRecord>> {
        let dispatches = self.dispatches.lock().unwrap();
        Ok(dispatches
            .iter()
            .filter(|d| d.status == DispatchStatus::Pending)
            .min_by_key(|d| (d.created_at, d.id))
            .cloned())
    }

    async fn claim(&self, dispatch_id: i64, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let mut dispatches = self.dispatches.lock().unwrap();
        let Some(dispatch) = dispatches
            .iter_mut()
            .find(|d| d.id == dispatch_id && d.status == DispatchStatus::Pending)
        else {
            return Ok(false);
        };
        dispatch.status = DispatchStatus::InProgress;
        dispatch.worker_id = Some(worker_id.to_string());
        dispatch.claimed_at = Some(now);
        Ok(true)
    }

    async fn get(&self, id: i64) -> DbResult<DispatchRecord> {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("dispatch {id}")))
    }

    async fn list(&self, filter: DispatchFilter) -> DbResult<Vec<DispatchRecord>> {
        let dispatches = self.dispatches.lock().unwrap();
        let mut out: Vec<_> = dispatches
            .iter()
            .filter(|d| filter.job_id.map(|id| d.job_id == id).unwrap_or(true))
            .filter(|d| filter.status.map(|s| d.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(filter.limit.unwrap_or(100) as usize);
        Ok(out)
    }

    async fn stuck_in_progress(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> DbResult<Vec<DispatchRecord>> {
        let dispatches = self.dispatches.lock().unwrap();
        Ok(dispatches
            .iter()
            .filter(|d| {
                d.status == DispatchStatus::InProgress
                    && d.claimed_at.is_some_and(|t| t < claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn expire(
        &self,
        dispatch_id: i64,
        now: DateTime<Utc>,
        error_message: &str,
        log_output: &str,
        retry_count: Option<i32>,
    ) -> DbResult<bool> {
        let (job_id, run_time) = {
            let mut dispatches = self.dispatches.lock().unwrap();
            let Some(dispatch) = dispatches
                .iter_mut()
                .find(|d| d.id == dispatch_id && d.status == DispatchStatus::InProgress)
            else {
                return Ok(false);
            };
            dispatch.status = DispatchStatus::Timeout;
            dispatch.completed_at = Some(now);
            dispatch.error_message = Some(error_message.to_string());
            (dispatch.job_id, dispatch.claimed_at.unwrap_or(now))
        };
        self.push_log(job_id, run_time, ExecutionStatus::Timeout, log_output);
        if let Some(retry_count) = retry_count {
            let retry = DispatchRecord {
                id: Self::next_id(&self.next_dispatch_id),
                job_id,
                created_at: now,
                claimed_at: None,
                completed_at: None,
                status: DispatchStatus::Pending,
                worker_id: None,
                retry_count,
                error_message: None,
            };
            self.dispatches.lock().unwrap().push(retry);
        }
        Ok(true)
    }

    async fn report_result(&self, report: DispatchReport) -> DbResult<bool> {
        let recorded = {
            let mut dispatches = self.dispatches.lock().unwrap();
            match dispatches.iter_mut().find(|d| {
                d.id == report.dispatch_id
                    && d.worker_id.as_deref() == Some(report.worker_id.as_str())
                    && d.status == DispatchStatus::InProgress
            }) {
                Some(dispatch) => {
                    dispatch.status = report.execution.dispatch_status();
                    dispatch.completed_at = Some(report.completed_at);
                    dispatch.error_message = report.error_message.clone();
                    true
                }
                None => false,
            }
        };
        if recorded {
            self.push_log(
                report.job_id,
                report.started_at,
                report.execution,
                &report.log_output,
            );
        }
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers
            .iter_mut()
            .find(|w| w.worker_id == report.worker_id)
        {
            worker.status = WorkerStatus::Idle;
            worker.current_job_id = None;
            worker.jobs_processed += 1;
            worker.last_heartbeat = report.completed_at;
        }
        Ok(recorded)
    }

    async fn release_for_worker(&self, worker_id: &str) -> DbResult<u64> {
        let mut dispatches = self.dispatches.lock().unwrap();
        let mut released = 0;
        for dispatch in dispatches.iter_mut().filter(|d| {
            d.worker_id.as_deref() == Some(worker_id) && d.status == DispatchStatus::InProgress
        }) {
            dispatch.status = DispatchStatus::Pending;
            dispatch.worker_id = None;
            dispatch.claimed_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut dispatches = self.dispatches.lock().unwrap();
        let before = dispatches.len();
        dispatches.retain(|d| {
            !(d.status.is_terminal() && d.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - dispatches.len()) as u64)
    }
}

#[async_trait]
impl WorkerRepo for MemStore {
    async fn register(&self, worker: &WorkerRecord) -> DbResult<()> {
        let mut workers = self.workers.lock().unwrap();
        if workers.iter().any(|w| w.worker_id == worker.worker_id) {
            return Err(DbError::Duplicate(format!("worker {}", worker.worker_id)));
        }
        workers.push(worker.clone());
        Ok(())
    }

    async fn reregister(&self, worker: &WorkerRecord) -> DbResult<()> {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| w.worker_id != worker.worker_id);
        workers.push(worker.clone());
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let mut workers = self.workers.lock().unwrap();
        match workers.iter_mut().find(|w| w.worker_id == worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_job_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut workers = self.workers.lock().unwrap();
        match workers.iter_mut().find(|w| w.worker_id == worker_id) {
            Some(worker) => {
                worker.status = status;
                worker.current_job_id = current_job_id;
                worker.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, worker_id: &str) -> DbResult<Option<WorkerRecord>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.worker_id == worker_id)
            .cloned())
    }

    async fn delete(&self, worker_id: &str) -> DbResult<()> {
        self.workers
            .lock()
            .unwrap()
            .retain(|w| w.worker_id != worker_id);
        Ok(())
    }

    async fn reap_stale(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<String>> {
        let mut workers = self.workers.lock().unwrap();
        let reaped: Vec<String> = workers
            .iter()
            .filter(|w| w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect();
        workers.retain(|w| w.last_heartbeat >= cutoff);
        // The schema nulls out worker_id on delete.
        let mut dispatches = self.dispatches.lock().unwrap();
        for dispatch in dispatches.iter_mut() {
            if dispatch
                .worker_id
                .as_deref()
                .is_some_and(|id| reaped.iter().any(|r| r == id))
            {
                dispatch.worker_id = None;
            }
        }
        Ok(reaped)
    }

    async fn active(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<WorkerRecord>> {
        let mut out: Vec<_> = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.last_heartbeat > cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|w| w.started_at);
        Ok(out)
    }
}

#[async_trait]
impl ExecutionLogRepo for MemStore {
    async fn insert(
        &self,
        job_id: i64,
        run_time: DateTime<Utc>,
        status: ExecutionStatus,
        log_output: &str,
    ) -> DbResult<ExecutionLogRecord> {
        Ok(self.push_log(job_id, run_time, status, log_output))
    }

    async fn list_for_job(&self, job_id: i64, limit: i64) -> DbResult<Vec<ExecutionLogRecord>> {
        let logs = self.logs.lock().unwrap();
        let mut out: Vec<_> = logs.iter().filter(|l| l.job_id == job_id).cloned().collect();
        out.sort_by(|a, b| b.run_time.cmp(&a.run_time));
        out.truncate(limit as usize);
        Ok(out)
    }
}
