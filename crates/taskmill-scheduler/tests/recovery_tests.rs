//! End-to-end recovery scenarios over the in-memory store: a worker claims
//! work and dies, and the reaper plus timeout sweep bring the job back.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use taskmill_config::SchedulerConfig;
use taskmill_core::{DispatchStatus, ExecutionStatus, ScheduleKind, WorkerStatus};
use taskmill_db::mem::MemStore;
use taskmill_db::{DispatchRepo, JobRepo, NewJob, WorkerRecord, WorkerRepo};
use taskmill_scheduler::Scheduler;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn registration(worker_id: &str, at: DateTime<Utc>) -> WorkerRecord {
    WorkerRecord {
        worker_id: worker_id.into(),
        hostname: "host-7".into(),
        platform: "linux".into(),
        started_at: at,
        last_heartbeat: at,
        status: WorkerStatus::Busy,
        jobs_processed: 0,
        current_job_id: Some(1),
        process_id: 7777,
    }
}

/// A worker claims a dispatch at t0 and disappears. The reaper removes its
/// registration once the heartbeat ages out; the sweep then times the
/// dispatch out and queues a retry. Total recovery latency stays within
/// offline_threshold + timeout_threshold + one sweep cadence.
#[tokio::test]
async fn crashed_worker_is_reaped_and_its_dispatch_retried() {
    let store = Arc::new(MemStore::new());
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
    );

    let t0 = utc(2025, 6, 1, 12, 0, 0);
    let job = JobRepo::create(
        store.as_ref(),
        NewJob {
            name: "ingest".into(),
            script_path: "ingest.sh".into(),
            schedule_type: ScheduleKind::Interval,
            interval_seconds: Some(7200),
            schedule_minute: None,
            schedule_time: None,
            schedule_day: None,
            is_active: true,
            next_run: Some(t0),
        },
    )
    .await
    .unwrap();

    // Dispatch cycle creates the work item; the doomed worker claims it.
    assert_eq!(scheduler.dispatch_cycle(t0).await.unwrap(), 1);
    let dispatch = store.oldest_pending().await.unwrap().unwrap();
    WorkerRepo::register(store.as_ref(), &registration("worker-doomed", t0))
        .await
        .unwrap();
    assert!(store.claim(dispatch.id, "worker-doomed", t0).await.unwrap());

    // Before the offline threshold nothing happens: the heartbeat is not yet
    // stale, so the dispatch is presumed alive.
    let early = t0 + Duration::seconds(120);
    assert_eq!(scheduler.reap_workers(early).await.unwrap(), 0);

    // At t0 + 180s the registration is reaped.
    let reap_at = t0 + Duration::seconds(181);
    assert_eq!(scheduler.reap_workers(reap_at).await.unwrap(), 1);
    assert!(store.workers().is_empty());

    // The dispatch is not yet past the timeout threshold; the sweep waits.
    assert_eq!(scheduler.timeout_sweep(reap_at).await.unwrap(), 0);

    // At t0 + 600s + sweep cadence the dispatch is expired and retried.
    let sweep_at = t0 + Duration::seconds(601);
    assert_eq!(scheduler.timeout_sweep(sweep_at).await.unwrap(), 1);

    let dispatches = store.dispatches();
    assert_eq!(dispatches.len(), 2);
    let expired = dispatches.iter().find(|d| d.id == dispatch.id).unwrap();
    assert_eq!(expired.status, DispatchStatus::Timeout);
    let retry = dispatches.iter().find(|d| d.id != dispatch.id).unwrap();
    assert_eq!(retry.status, DispatchStatus::Pending);
    assert_eq!(retry.retry_count, 1);
    assert_eq!(retry.job_id, job.id);

    // Exactly one TIMEOUT log row for the terminal outcome.
    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Timeout);

    // A fresh worker can pick up the retry.
    assert!(store.claim(retry.id, "worker-healthy", sweep_at).await.unwrap());
}

/// Invariant: no worker absent from the registration table keeps an
/// IN_PROGRESS dispatch once a reap + sweep pass has run.
#[tokio::test]
async fn absent_workers_hold_no_in_progress_dispatches_after_a_pass() {
    let store = Arc::new(MemStore::new());
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
    );

    let t0 = utc(2025, 6, 1, 0, 0, 0);
    for n in 0..3 {
        let job = JobRepo::create(
            store.as_ref(),
            NewJob {
                name: format!("job {n}"),
                script_path: format!("job{n}.sh"),
                schedule_type: ScheduleKind::Interval,
                interval_seconds: Some(86_400),
                schedule_minute: None,
                schedule_time: None,
                schedule_day: None,
                is_active: true,
                next_run: Some(t0),
            },
        )
        .await
        .unwrap();
        let dispatch = store
            .dispatch_job(job.id, t0, None, t0 + Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .claim(dispatch.id, &format!("worker-{n}"), t0)
            .await
            .unwrap());
    }

    let pass_at = t0 + Duration::seconds(700);
    scheduler.reap_workers(pass_at).await.unwrap();
    scheduler.timeout_sweep(pass_at).await.unwrap();

    let live: Vec<String> = store
        .workers()
        .into_iter()
        .map(|w| w.worker_id)
        .collect();
    for dispatch in store.dispatches() {
        if dispatch.status == DispatchStatus::InProgress {
            let holder = dispatch.worker_id.expect("in-progress dispatch with no worker");
            assert!(live.contains(&holder));
        }
    }
    // All three were orphaned, so all three got expired and retried.
    assert_eq!(
        store
            .dispatches()
            .iter()
            .filter(|d| d.status == DispatchStatus::Timeout)
            .count(),
        3
    );
}
