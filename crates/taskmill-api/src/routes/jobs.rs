//! Job management endpoints.
//!
//! All writes land here, and this is the boundary where display-timezone
//! schedule times become UTC, converted with the zone's offset at the moment
//! of the save, never a cached one.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use taskmill_core::{timezone, Schedule, ScheduleKind};
use taskmill_db::{ExecutionLogRecord, ExecutionLogRepo, JobRecord, JobRepo, NewJob};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/{id}/run", post(run_job_now))
        .route("/{id}/toggle", post(toggle_job))
        .route("/{id}/logs", get(list_job_logs))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    search: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let jobs = state.jobs.list(query.search.as_deref()).await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
struct JobPayload {
    name: String,
    script_path: String,
    schedule_type: ScheduleKind,
    interval_seconds: Option<i64>,
    schedule_minute: Option<i16>,
    schedule_time: Option<String>,
    schedule_day: Option<i16>,
    /// IANA zone `schedule_time`/`schedule_day` are expressed in. When
    /// present they are converted to UTC before persistence; when absent
    /// they are taken as UTC already.
    timezone: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

impl JobPayload {
    /// Validate and normalize into a UTC `NewJob`, computing the initial
    /// `next_run` for active non-manual jobs.
    fn into_new_job(self, state: &AppState, now: DateTime<Utc>) -> Result<NewJob, ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".into()));
        }
        state.script_root.resolve(&self.script_path)?;

        let (schedule_time, schedule_day) = match (&self.timezone, &self.schedule_time) {
            (Some(zone), Some(time)) => {
                let (time, day) = timezone::schedule_to_utc(
                    self.schedule_type,
                    time,
                    self.schedule_day,
                    zone,
                    now,
                )?;
                (Some(time), day)
            }
            _ => (self.schedule_time, self.schedule_day),
        };

        let schedule = Schedule::from_parts(
            self.schedule_type,
            self.interval_seconds,
            self.schedule_minute,
            schedule_time.as_deref(),
            schedule_day,
        )?;
        let next_run = if self.is_active {
            schedule.next_run_after(now)
        } else {
            None
        };

        Ok(NewJob {
            name: self.name,
            script_path: self.script_path,
            schedule_type: self.schedule_type,
            interval_seconds: self.interval_seconds,
            schedule_minute: self.schedule_minute,
            schedule_time,
            schedule_day,
            is_active: self.is_active,
            next_run,
        })
    }
}

async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<JobPayload>,
) -> Result<Json<JobRecord>, ApiError> {
    let new_job = payload.into_new_job(&state, Utc::now())?;
    let job = state.jobs.create(new_job).await?;
    Ok(Json(job))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.jobs.get(id).await?))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<JobPayload>,
) -> Result<Json<JobRecord>, ApiError> {
    let new_job = payload.into_new_job(&state, Utc::now())?;
    let job = state.jobs.update(id, new_job).await?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.jobs.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// "Run Now": make the job due immediately; the next scheduler cycle picks
/// it up.
async fn run_job_now(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state.jobs.run_now(id, Utc::now()).await?;
    Ok(Json(job))
}

async fn toggle_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state.jobs.get(id).await?;
    let now = Utc::now();
    let activating = !job.is_active;
    let next_run = if activating {
        job.schedule()?.next_run_after(now)
    } else {
        None
    };
    let job = state.jobs.set_active(id, activating, next_run).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
}

async fn list_job_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<ExecutionLogRecord>>, ApiError> {
    // 404 for unknown jobs rather than an empty list.
    state.jobs.get(id).await?;
    let logs = state
        .logs
        .list_for_job(id, query.limit.unwrap_or(50).clamp(1, 500))
        .await?;
    Ok(Json(logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use sqlx::PgPool;
    use std::sync::Arc;
    use std::time::Duration;
    use taskmill_core::ScriptRoot;
    use taskmill_db::mem::MemStore;
    use taskmill_db::JobRepo;
    use tower::ServiceExt;

    fn test_app(store: &Arc<MemStore>) -> axum::Router {
        let pool = PgPool::connect_lazy("postgres://taskmill@localhost/taskmill").unwrap();
        let state = AppState::with_repos(
            pool,
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            ScriptRoot::new("scripts"),
            Duration::from_secs(180),
        );
        crate::routes::router(state)
    }

    async fn post_json(app: axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn create_daily_job_initializes_next_run() {
        let store = Arc::new(MemStore::new());
        let (status, body) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "nightly report",
                "script_path": "report.sh",
                "schedule_type": "daily",
                "schedule_time": "01:00",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule_time"], "01:00");
        assert!(body["next_run"].as_str().unwrap().contains("01:00:00"));
    }

    #[tokio::test]
    async fn display_timezone_is_converted_at_save_time() {
        // A user in UTC+8 entering 00:30 local must get 16:30 stored, and a
        // first next_run at 16:30 UTC, not 00:30 UTC.
        let store = Arc::new(MemStore::new());
        let (status, body) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "hk morning sync",
                "script_path": "sync.sh",
                "schedule_type": "daily",
                "schedule_time": "00:30",
                "timezone": "Asia/Hong_Kong",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule_time"], "16:30");
        assert!(body["next_run"].as_str().unwrap().contains("16:30:00"));
    }

    #[tokio::test]
    async fn invalid_schedules_are_rejected() {
        let store = Arc::new(MemStore::new());
        let (status, _) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "broken",
                "script_path": "x.sh",
                "schedule_type": "daily",
                // no schedule_time
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn escaping_script_paths_are_rejected() {
        let store = Arc::new(MemStore::new());
        let (status, _) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "sneaky",
                "script_path": "../../etc/passwd",
                "schedule_type": "manual",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manual_jobs_start_with_no_next_run_and_run_on_demand() {
        let store = Arc::new(MemStore::new());
        let (status, body) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "ad hoc",
                "script_path": "adhoc.sh",
                "schedule_type": "manual",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["next_run"].is_null());

        let id = body["id"].as_i64().unwrap();
        let (status, body) = post_json(
            test_app(&store),
            &format!("/api/v1/jobs/{id}/run"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["next_run"].is_null());
    }

    #[tokio::test]
    async fn run_now_on_inactive_job_conflicts() {
        let store = Arc::new(MemStore::new());
        let (_, body) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "paused",
                "script_path": "paused.sh",
                "schedule_type": "manual",
                "is_active": false,
            }),
        )
        .await;
        let id = body["id"].as_i64().unwrap();
        let (status, _) = post_json(
            test_app(&store),
            &format!("/api/v1/jobs/{id}/run"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn toggle_recomputes_next_run_from_the_schedule() {
        let store = Arc::new(MemStore::new());
        let (_, body) = post_json(
            test_app(&store),
            "/api/v1/jobs",
            serde_json::json!({
                "name": "hourly tick",
                "script_path": "tick.sh",
                "schedule_type": "hourly",
                "schedule_minute": 15,
            }),
        )
        .await;
        let id = body["id"].as_i64().unwrap();

        // Deactivate: next_run cleared.
        let (status, body) = post_json(
            test_app(&store),
            &format!("/api/v1/jobs/{id}/toggle"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);
        assert!(body["next_run"].is_null());

        // Reactivate: next_run recomputed.
        let (status, body) = post_json(
            test_app(&store),
            &format!("/api/v1/jobs/{id}/toggle"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
        assert!(body["next_run"].as_str().unwrap().contains(":15:00"));
    }

    #[tokio::test]
    async fn unknown_job_is_a_404() {
        let store = Arc::new(MemStore::new());
        let response = test_app(&store)
            .oneshot(Request::get("/api/v1/jobs/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
