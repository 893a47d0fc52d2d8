//! Dispatch listing endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use taskmill_core::DispatchStatus;
use taskmill_db::{DispatchFilter, DispatchRecord, DispatchRepo};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_dispatches))
        .route("/{id}", get(get_dispatch))
}

#[derive(Debug, Deserialize)]
struct ListDispatchesQuery {
    job_id: Option<i64>,
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_dispatches(
    State(state): State<AppState>,
    Query(query): Query<ListDispatchesQuery>,
) -> Result<Json<Vec<DispatchRecord>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DispatchStatus>)
        .transpose()
        .map_err(|_| ApiError::BadRequest(format!("unknown status: {:?}", query.status)))?;
    let dispatches = state
        .dispatches
        .list(DispatchFilter {
            job_id: query.job_id,
            status,
            limit: query.limit.map(|l| l.clamp(1, 1000)),
        })
        .await?;
    Ok(Json(dispatches))
}

async fn get_dispatch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DispatchRecord>, ApiError> {
    Ok(Json(state.dispatches.get(id).await?))
}
