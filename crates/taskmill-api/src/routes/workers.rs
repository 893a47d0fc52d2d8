//! Worker fleet endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};

use taskmill_db::{WorkerRecord, WorkerRepo};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_active_workers))
}

/// The active-workers view: registrations with a heartbeat fresher than the
/// offline threshold. Anything older is about to be reaped and is not shown.
async fn list_active_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerRecord>>, ApiError> {
    let cutoff =
        Utc::now() - Duration::seconds(state.worker_offline_threshold.as_secs() as i64);
    let workers = state.workers.active(cutoff).await?;
    Ok(Json(workers))
}
