//! Job admission, query, listing and cancellation.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use transforge_common::{Error, JobId, JobStatus, ValidationError};
use transforge_db::models::Job;

use super::auth::Principal;
use super::error::ApiError;
use super::AppState;
use crate::jobs::cancel_job;
use crate::validate::JobRequest;

/// Page size when the caller does not ask for one.
const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel))
}

async fn submit_job(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let Json(request) = payload?;
    let job = state.admission.admit(principal.owner, request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ValidationError::Unsupported)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let owner = (!principal.admin).then_some(principal.owner);

    let jobs = state.store.list(owner, status, limit).await?;
    Ok(Json(jobs))
}

/// Load a job the caller may see. Other owners' jobs look missing.
async fn visible_job(state: &AppState, principal: &Principal, id: i64) -> Result<Job, ApiError> {
    let job_id = JobId::from_row(id);
    match state.store.get(job_id).await? {
        Some(job) if principal.can_access(&job.owner) => Ok(job),
        _ => Err(Error::not_found("job", job_id).into()),
    }
}

async fn get_job(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Job>, ApiError> {
    let Path(id) = id?;
    visible_job(&state, &principal, id).await.map(Json)
}

/// Cancel a queued or running job. Cancelling a finished job changes
/// nothing and still succeeds.
async fn cancel(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Job>, ApiError> {
    let Path(id) = id?;
    let job = visible_job(&state, &principal, id).await?;
    cancel_job(&state.store, &state.registry, job.id).await?;
    Ok(Json(state.store.require(job.id).await?))
}
