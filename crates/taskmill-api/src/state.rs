//! Application state.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use taskmill_core::ScriptRoot;
use taskmill_db::{
    DispatchRepo, ExecutionLogRepo, JobRepo, PgDispatchRepo, PgExecutionLogRepo, PgJobRepo,
    PgWorkerRepo, WorkerRepo,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jobs: Arc<dyn JobRepo>,
    pub dispatches: Arc<dyn DispatchRepo>,
    pub workers: Arc<dyn WorkerRepo>,
    pub logs: Arc<dyn ExecutionLogRepo>,
    /// Used only to validate the shape of submitted script paths; the worker
    /// re-validates against its own root at execution time.
    pub script_root: ScriptRoot,
    /// Heartbeat age past which a worker no longer counts as active.
    pub worker_offline_threshold: Duration,
}

impl AppState {
    pub fn new(pool: PgPool, script_root: ScriptRoot, worker_offline_threshold: Duration) -> Self {
        Self {
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            dispatches: Arc::new(PgDispatchRepo::new(pool.clone())),
            workers: Arc::new(PgWorkerRepo::new(pool.clone())),
            logs: Arc::new(PgExecutionLogRepo::new(pool.clone())),
            pool,
            script_root,
            worker_offline_threshold,
        }
    }

    /// Build state around externally supplied repositories; the in-memory
    /// store uses this in tests.
    #[allow(clippy::too_many_arguments)]
    pub fn with_repos(
        pool: PgPool,
        jobs: Arc<dyn JobRepo>,
        dispatches: Arc<dyn DispatchRepo>,
        workers: Arc<dyn WorkerRepo>,
        logs: Arc<dyn ExecutionLogRepo>,
        script_root: ScriptRoot,
        worker_offline_threshold: Duration,
    ) -> Self {
        Self {
            pool,
            jobs,
            dispatches,
            workers,
            logs,
            script_root,
            worker_offline_threshold,
        }
    }
}
