//! Repository traits and implementations.

pub mod dispatch;
pub mod execution_log;
pub mod job;
pub mod worker;

pub use dispatch::{
    DispatchFilter, DispatchRecord, DispatchReport, DispatchRepo, PgDispatchRepo,
};
pub use execution_log::{ExecutionLogRecord, ExecutionLogRepo, PgExecutionLogRepo};
pub use job::{JobRecord, JobRepo, NewJob, PgJobRepo};
pub use worker::{PgWorkerRepo, WorkerRecord, WorkerRepo};
