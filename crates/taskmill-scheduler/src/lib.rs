//! Scheduler control loop.
//!
//! Maintains the invariant that every active job with `next_run <= now` and
//! no outstanding dispatch produces exactly one PENDING dispatch, and that
//! stuck dispatches get resolved. Four periodic sub-tasks run from a single
//! loop at distinct cadences:
//!
//! 1. dispatch cycle, every tick
//! 2. timeout sweep, every 6th tick
//! 3. worker reaper, every 10th tick
//! 4. dispatch cleanup, every 360th tick
//!
//! Multiple scheduler instances may run concurrently; the per-job
//! `dispatch_lock_until` conditional update decides which one dispatches.

pub mod shutdown;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskmill_config::SchedulerConfig;
use taskmill_db::{with_retries, DbResult, DispatchRepo, JobRepo, WorkerRepo};

const TIMEOUT_SWEEP_EVERY: u64 = 6;
const REAPER_EVERY: u64 = 10;
const CLEANUP_EVERY: u64 = 360;

/// Consecutive transient-error budget before the loop gives up and the
/// process exits for supervision to restart.
const DB_RETRY_ATTEMPTS: u32 = 5;

/// The scheduler service.
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Arc<dyn JobRepo>,
    dispatches: Arc<dyn DispatchRepo>,
    workers: Arc<dyn WorkerRepo>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<dyn JobRepo>,
        dispatches: Arc<dyn DispatchRepo>,
        workers: Arc<dyn WorkerRepo>,
    ) -> Self {
        Self {
            config,
            jobs,
            dispatches,
            workers,
        }
    }

    /// Run the control loop until the shutdown token fires or the database
    /// becomes persistently unreachable.
    pub async fn run(&self, shutdown: CancellationToken) -> DbResult<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            lock_duration = ?self.config.dispatch_lock_duration,
            timeout_threshold = ?self.config.timeout_threshold,
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut iteration: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            iteration += 1;
            let now = Utc::now();

            with_retries("dispatch cycle", DB_RETRY_ATTEMPTS, || {
                self.dispatch_cycle(now)
            })
            .await?;

            if iteration % TIMEOUT_SWEEP_EVERY == 0 {
                with_retries("timeout sweep", DB_RETRY_ATTEMPTS, || {
                    self.timeout_sweep(now)
                })
                .await?;
            }
            if iteration % REAPER_EVERY == 0 {
                with_retries("worker reaper", DB_RETRY_ATTEMPTS, || {
                    self.reap_workers(now)
                })
                .await?;
            }
            if iteration % CLEANUP_EVERY == 0 {
                with_retries("dispatch cleanup", DB_RETRY_ATTEMPTS, || self.cleanup(now))
                    .await?;
            }
        }
    }

    /// Find due jobs and create one PENDING dispatch each.
    ///
    /// Losing the per-job conditional update to a concurrent scheduler is
    /// expected, not an error.
    pub async fn dispatch_cycle(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let due = self.jobs.due(now).await?;
        if due.is_empty() {
            debug!(%now, "no due jobs");
            return Ok(0);
        }

        let lock_until = now + Duration::seconds(self.config.dispatch_lock_duration.as_secs() as i64);
        let mut dispatched = 0;
        for job in due {
            let schedule = match job.schedule() {
                Ok(schedule) => schedule,
                Err(error) => {
                    warn!(job_id = job.id, %error, "job has an invalid schedule, skipping");
                    continue;
                }
            };
            let next_run = schedule.next_run_after(now);
            match self
                .dispatches
                .dispatch_job(job.id, now, next_run, lock_until)
                .await?
            {
                Some(dispatch) => {
                    dispatched += 1;
                    info!(
                        job_id = job.id,
                        job_name = %job.name,
                        dispatch_id = dispatch.id,
                        next_run = ?next_run,
                        "dispatched job"
                    );
                }
                None => {
                    debug!(job_id = job.id, "lost dispatch window to another scheduler");
                }
            }
        }
        Ok(dispatched)
    }

    /// Resolve dispatches stuck in IN_PROGRESS whose worker has died.
    ///
    /// A dispatch past the timeout threshold is expired only when its worker
    /// row is gone or its heartbeat is stale; a live worker running a long
    /// script is left alone, its own wall-clock limit is the backstop.
    pub async fn timeout_sweep(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let claimed_before =
            now - Duration::seconds(self.config.timeout_threshold.as_secs() as i64);
        let heartbeat_cutoff =
            now - Duration::seconds(self.config.worker_offline_threshold.as_secs() as i64);

        let stuck = self.dispatches.stuck_in_progress(claimed_before).await?;
        let mut expired = 0;
        for dispatch in stuck {
            let worker_alive = match dispatch.worker_id.as_deref() {
                None => false,
                Some(worker_id) => match self.workers.get(worker_id).await? {
                    Some(worker) => worker.last_heartbeat >= heartbeat_cutoff,
                    None => false,
                },
            };
            if worker_alive {
                debug!(
                    dispatch_id = dispatch.id,
                    "dispatch past threshold but worker still heartbeating"
                );
                continue;
            }

            let worker = dispatch.worker_id.as_deref().unwrap_or("unknown");
            let retry = (dispatch.retry_count < self.config.max_retry_attempts)
                .then(|| dispatch.retry_count + 1);
            let error_message = format!("worker {worker} died during execution");
            let log_output = format!(
                "Job timed out after {}s. Worker {} went offline.",
                self.config.timeout_threshold.as_secs(),
                worker
            );
            if self
                .dispatches
                .expire(dispatch.id, now, &error_message, &log_output, retry)
                .await?
            {
                expired += 1;
                warn!(
                    dispatch_id = dispatch.id,
                    job_id = dispatch.job_id,
                    worker_id = worker,
                    retry = ?retry,
                    "expired stuck dispatch"
                );
                if retry.is_none() {
                    warn!(
                        job_id = dispatch.job_id,
                        attempts = self.config.max_retry_attempts,
                        "retry budget exhausted"
                    );
                }
            }
        }
        Ok(expired)
    }

    /// Delete worker registrations whose heartbeat aged past the offline
    /// threshold. Their dispatches lose the worker reference via the foreign
    /// key and the next timeout sweep recovers them.
    pub async fn reap_workers(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let cutoff =
            now - Duration::seconds(self.config.worker_offline_threshold.as_secs() as i64);
        let reaped = self.workers.reap_stale(cutoff).await?;
        for worker_id in &reaped {
            info!(worker_id = %worker_id, "reaped offline worker");
        }
        Ok(reaped.len())
    }

    /// Drop terminal dispatch rows past the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let cutoff = now - Duration::seconds(self.config.cleanup_retention.as_secs() as i64);
        let purged = self.dispatches.purge_terminal_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "purged old dispatch records");
        }
        Ok(purged)
    }
}
