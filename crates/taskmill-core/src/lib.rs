//! Core domain types for the Taskmill job scheduler.
//!
//! This crate contains:
//! - Schedule definitions and next-run arithmetic
//! - Dispatch, worker and execution-log status enums
//! - Timezone normalization for management-layer writes
//! - The script-root sandbox used by workers
//!
//! Everything here is pure: no database handles, no I/O. All timestamps are
//! timezone-aware UTC instants; naive datetimes never appear.

pub mod error;
pub mod schedule;
pub mod script;
pub mod status;
pub mod timezone;

pub use error::{Error, Result};
pub use schedule::{Schedule, ScheduleKind, TimeOfDay};
pub use script::ScriptRoot;
pub use status::{DispatchStatus, ExecutionStatus, WorkerStatus};
