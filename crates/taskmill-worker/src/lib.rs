//! Worker service: claim one dispatch at a time, execute it, report back.
//!
//! A worker is two concurrent tasks (the claim/execute loop here and the
//! [`heartbeat`] updater) plus the script child process. Fleet parallelism
//! comes from running many worker processes; a single worker never runs two
//! scripts at once.

pub mod backoff;
pub mod executor;
pub mod heartbeat;
pub mod shutdown;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmill_config::WorkerConfig;
use taskmill_core::{ExecutionStatus, ScriptRoot, WorkerStatus};
use taskmill_db::{
    with_retries, DbResult, DispatchRecord, DispatchReport, DispatchRepo, JobRecord, JobRepo,
    WorkerRecord, WorkerRepo,
};

use backoff::Backoff;
use executor::ScriptExecutor;
use heartbeat::Heartbeat;

/// Cap on the `error_message` column; the full output lives in the log row.
const ERROR_MESSAGE_CAP: usize = 4096;

/// Consecutive transient-error budget before the loop gives up.
const DB_RETRY_ATTEMPTS: u32 = 5;

/// The immutable facts a worker registers about itself.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub hostname: String,
    pub platform: String,
    pub process_id: i32,
    pub started_at: DateTime<Utc>,
}

impl WorkerIdentity {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("worker-{}", &suffix[..8]),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            process_id: std::process::id() as i32,
            started_at: Utc::now(),
        }
    }

    /// A registration row for this worker in the given state.
    pub fn registration(
        &self,
        now: DateTime<Utc>,
        status: WorkerStatus,
        current_job_id: Option<i64>,
    ) -> WorkerRecord {
        WorkerRecord {
            worker_id: self.worker_id.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            started_at: self.started_at,
            last_heartbeat: now,
            status,
            jobs_processed: 0,
            current_job_id,
            process_id: self.process_id,
        }
    }
}

/// What one poll of the queue produced.
#[derive(Debug)]
pub enum Poll {
    /// Nothing PENDING; back off.
    Empty,
    /// Another worker won the claim; there may be more work, poll again soon.
    LostRace,
    /// This worker owns the dispatch.
    Claimed(DispatchRecord, JobRecord),
}

/// The worker service.
pub struct Worker {
    config: WorkerConfig,
    identity: WorkerIdentity,
    jobs: Arc<dyn JobRepo>,
    dispatches: Arc<dyn DispatchRepo>,
    workers: Arc<dyn WorkerRepo>,
    executor: ScriptExecutor,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        identity: WorkerIdentity,
        jobs: Arc<dyn JobRepo>,
        dispatches: Arc<dyn DispatchRepo>,
        workers: Arc<dyn WorkerRepo>,
    ) -> Self {
        let executor = ScriptExecutor::new(
            ScriptRoot::new(config.script_root.clone()),
            config.job_timeout,
            config.output_cap,
        );
        Self {
            config,
            identity,
            jobs,
            dispatches,
            workers,
            executor,
        }
    }

    /// Register, run the claim loop until shutdown, then release any held
    /// dispatch and deregister.
    pub async fn run(&self, shutdown: CancellationToken) -> DbResult<()> {
        let now = Utc::now();
        self.workers
            .register(&self.identity.registration(now, WorkerStatus::Idle, None))
            .await?;
        info!(
            worker_id = %self.identity.worker_id,
            hostname = %self.identity.hostname,
            pid = self.identity.process_id,
            "worker registered"
        );

        let heartbeat_token = shutdown.child_token();
        let heartbeat = Heartbeat::new(
            self.workers.clone(),
            self.identity.clone(),
            self.config.heartbeat_interval,
        );
        let heartbeat_task = tokio::spawn(heartbeat.run(heartbeat_token.clone()));

        let result = self.poll_loop(&shutdown).await;

        if let Err(error) = self.release_and_deregister().await {
            warn!(error = %error, "shutdown cleanup failed; the timeout sweep is the backstop");
        }
        heartbeat_token.cancel();
        let _ = heartbeat_task.await;
        result
    }

    async fn poll_loop(&self, shutdown: &CancellationToken) -> DbResult<()> {
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_poll_interval);
        loop {
            if shutdown.is_cancelled() {
                info!("worker stopping");
                return Ok(());
            }
            let now = Utc::now();
            let poll = with_retries("claim poll", DB_RETRY_ATTEMPTS, || self.poll_once(now)).await?;
            match poll {
                Poll::Claimed(dispatch, job) => {
                    backoff.reset();
                    self.execute_and_report(dispatch, job, shutdown).await?;
                }
                Poll::LostRace => {
                    backoff.reset();
                }
                Poll::Empty => {
                    let delay = backoff.next();
                    debug!(?delay, "queue empty, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One poll: find the oldest PENDING dispatch and try the claim CAS.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> DbResult<Poll> {
        let Some(pending) = self.dispatches.oldest_pending().await? else {
            return Ok(Poll::Empty);
        };
        if !self
            .dispatches
            .claim(pending.id, &self.identity.worker_id, now)
            .await?
        {
            debug!(dispatch_id = pending.id, "lost claim race");
            return Ok(Poll::LostRace);
        }
        match self.jobs.get(pending.job_id).await {
            Ok(job) => {
                info!(
                    dispatch_id = pending.id,
                    job_id = job.id,
                    job_name = %job.name,
                    retry_count = pending.retry_count,
                    "claimed dispatch"
                );
                Ok(Poll::Claimed(pending, job))
            }
            Err(taskmill_db::DbError::NotFound(_)) => {
                // The job was deleted between dispatch and claim; the cascade
                // will have taken the dispatch row with it.
                warn!(
                    dispatch_id = pending.id,
                    job_id = pending.job_id,
                    "claimed dispatch whose job no longer exists"
                );
                Ok(Poll::LostRace)
            }
            Err(error) => Err(error),
        }
    }

    /// Execute the claimed script and record the outcome. On shutdown, the
    /// in-flight script gets the configured grace period; past that the
    /// dispatch is abandoned for `release_and_deregister` to reset.
    async fn execute_and_report(
        &self,
        dispatch: DispatchRecord,
        job: JobRecord,
        shutdown: &CancellationToken,
    ) -> DbResult<()> {
        let started_at = Utc::now();
        self.mark_busy(job.id, started_at).await?;

        let execution = self.executor.execute(&job.script_path);
        tokio::pin!(execution);
        let outcome = tokio::select! {
            outcome = &mut execution => outcome,
            _ = shutdown.cancelled() => {
                info!(
                    dispatch_id = dispatch.id,
                    grace = ?self.config.shutdown_grace,
                    "shutdown requested, letting in-flight script finish"
                );
                match tokio::time::timeout(self.config.shutdown_grace, &mut execution).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            dispatch_id = dispatch.id,
                            "grace period elapsed, releasing dispatch"
                        );
                        return Ok(());
                    }
                }
            }
        };
        let completed_at = Utc::now();

        let error_message = match outcome.status {
            ExecutionStatus::Success => None,
            _ => Some(truncate(&outcome.output, ERROR_MESSAGE_CAP)),
        };
        let report = DispatchReport {
            dispatch_id: dispatch.id,
            job_id: job.id,
            worker_id: self.identity.worker_id.clone(),
            execution: outcome.status,
            started_at,
            completed_at,
            log_output: outcome.output,
            error_message,
        };
        let recorded = with_retries("report result", DB_RETRY_ATTEMPTS, || {
            self.dispatches.report_result(report.clone())
        })
        .await?;
        if recorded {
            info!(
                dispatch_id = dispatch.id,
                job_id = job.id,
                status = %outcome.status,
                "reported result"
            );
        } else {
            // The timeout sweep resolved it first; its log row stands.
            warn!(
                dispatch_id = dispatch.id,
                "dispatch was already resolved, result discarded"
            );
        }
        Ok(())
    }

    async fn mark_busy(&self, job_id: i64, now: DateTime<Utc>) -> DbResult<()> {
        let found = self
            .workers
            .set_status(&self.identity.worker_id, WorkerStatus::Busy, Some(job_id), now)
            .await?;
        if !found {
            warn!(
                worker_id = %self.identity.worker_id,
                "registration row missing, re-registering"
            );
            self.workers
                .reregister(&self.identity.registration(now, WorkerStatus::Busy, Some(job_id)))
                .await?;
        }
        Ok(())
    }

    /// Graceful-shutdown tail: put any still-held dispatch back on the queue
    /// and remove the registration row.
    pub async fn release_and_deregister(&self) -> DbResult<()> {
        let released = self
            .dispatches
            .release_for_worker(&self.identity.worker_id)
            .await?;
        if released > 0 {
            warn!(released, "released in-progress dispatches back to PENDING");
        }
        self.workers.delete(&self.identity.worker_id).await?;
        info!(worker_id = %self.identity.worker_id, "worker deregistered");
        Ok(())
    }
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use taskmill_core::{DispatchStatus, ScheduleKind};
    use taskmill_db::mem::MemStore;
    use taskmill_db::NewJob;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn identity(id: &str) -> WorkerIdentity {
        WorkerIdentity {
            worker_id: id.to_string(),
            hostname: "test-host".into(),
            platform: "linux".into(),
            process_id: 1234,
            started_at: utc(2025, 6, 1, 0, 0, 0),
        }
    }

    fn worker_with_root(store: &Arc<MemStore>, id: &str, script_root: std::path::PathBuf) -> Worker {
        let config = WorkerConfig {
            script_root,
            ..WorkerConfig::default()
        };
        Worker::new(
            config,
            identity(id),
            store.clone(),
            store.clone(),
            store.clone(),
        )
    }

    async fn seed_dispatch(store: &Arc<MemStore>, script_path: &str) -> (i64, i64) {
        let now = utc(2025, 6, 1, 12, 0, 0);
        let job = JobRepo::create(
            store.as_ref(),
            NewJob {
                name: "test job".into(),
                script_path: script_path.into(),
                schedule_type: ScheduleKind::Interval,
                interval_seconds: Some(3600),
                schedule_minute: None,
                schedule_time: None,
                schedule_day: None,
                is_active: true,
                next_run: Some(now),
            },
        )
        .await
        .unwrap();
        let dispatch = store
            .dispatch_job(job.id, now, None, now + Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        (job.id, dispatch.id)
    }

    #[tokio::test]
    async fn exactly_one_worker_wins_a_claim() {
        let store = Arc::new(MemStore::new());
        let (_, dispatch_id) = seed_dispatch(&store, "noop.sh").await;
        let now = utc(2025, 6, 1, 12, 0, 1);
        let first = store.claim(dispatch_id, "worker-a", now).await.unwrap();
        let second = store.claim(dispatch_id, "worker-b", now).await.unwrap();
        assert!(first);
        assert!(!second);
        let record = DispatchRepo::get(store.as_ref(), dispatch_id).await.unwrap();
        assert_eq!(record.worker_id.as_deref(), Some("worker-a"));
        assert_eq!(record.status, DispatchStatus::InProgress);
    }

    #[tokio::test]
    async fn poll_claims_the_oldest_pending_dispatch() {
        let store = Arc::new(MemStore::new());
        let (_, first_id) = seed_dispatch(&store, "one.sh").await;
        let (_, _second_id) = seed_dispatch(&store, "two.sh").await;
        let worker = worker_with_root(&store, "worker-a", std::env::temp_dir());

        let poll = worker.poll_once(utc(2025, 6, 1, 12, 0, 5)).await.unwrap();
        match poll {
            Poll::Claimed(dispatch, job) => {
                assert_eq!(dispatch.id, first_id);
                assert_eq!(job.script_path, "one.sh");
            }
            other => panic!("expected a claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_queue_polls_return_empty() {
        let store = Arc::new(MemStore::new());
        let worker = worker_with_root(&store, "worker-a", std::env::temp_dir());
        assert!(matches!(
            worker.poll_once(utc(2025, 6, 1, 12, 0, 0)).await.unwrap(),
            Poll::Empty
        ));
    }

    #[tokio::test]
    async fn release_and_deregister_returns_dispatch_to_queue() {
        let store = Arc::new(MemStore::new());
        let (_, dispatch_id) = seed_dispatch(&store, "noop.sh").await;
        let worker = worker_with_root(&store, "worker-a", std::env::temp_dir());
        let now = utc(2025, 6, 1, 12, 0, 1);
        WorkerRepo::register(
            store.as_ref(),
            &worker.identity.registration(now, WorkerStatus::Idle, None),
        )
        .await
        .unwrap();
        assert!(store.claim(dispatch_id, "worker-a", now).await.unwrap());

        worker.release_and_deregister().await.unwrap();

        let record = DispatchRepo::get(store.as_ref(), dispatch_id).await.unwrap();
        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(record.worker_id, None);
        assert_eq!(record.claimed_at, None);
        assert!(store.workers().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn claim_execute_report_round_trip() {
        use taskmill_core::ExecutionStatus;

        let dir = std::env::temp_dir().join(format!("taskmill-worker-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("greet.sh"), "echo done\n").unwrap();

        let store = Arc::new(MemStore::new());
        let (job_id, dispatch_id) = seed_dispatch(&store, "greet.sh").await;
        let worker = worker_with_root(&store, "worker-a", dir);
        let now = utc(2025, 6, 1, 12, 0, 1);
        WorkerRepo::register(
            store.as_ref(),
            &worker.identity.registration(now, WorkerStatus::Idle, None),
        )
        .await
        .unwrap();

        let poll = worker.poll_once(now).await.unwrap();
        let Poll::Claimed(dispatch, job) = poll else {
            panic!("expected a claim");
        };
        let shutdown = CancellationToken::new();
        worker
            .execute_and_report(dispatch, job, &shutdown)
            .await
            .unwrap();

        let record = DispatchRepo::get(store.as_ref(), dispatch_id).await.unwrap();
        assert_eq!(record.status, DispatchStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(record.error_message, None);

        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].job_id, job_id);
        assert_eq!(logs[0].status, ExecutionStatus::Success);
        assert!(logs[0].log_output.contains("done"));

        let workers = store.workers();
        assert_eq!(workers[0].status, WorkerStatus::Idle);
        assert_eq!(workers[0].jobs_processed, 1);
        assert_eq!(workers[0].current_job_id, None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 100), "short");
        let long = "é".repeat(100);
        let cut = truncate(&long, 11);
        assert!(cut.len() <= 14);
        assert!(cut.ends_with("..."));
    }
}
