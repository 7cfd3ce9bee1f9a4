use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use uuid::Uuid;

use crate::error::AppError;
use crate::intake::SubmitPayload;

use super::dto::{CancelRequest, JobView, ListJobsQuery};
use super::{AppErrorResponse, AppState};

pub async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<SubmitPayload>,
) -> Result<(StatusCode, Json<crate::intake::SubmitOutcome>), AppErrorResponse> {
    let outcome = state.intake.submit(payload).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, AppErrorResponse> {
    let job = state
        .store
        .fetch_job(id)
        .await
        .map_err(AppError::from_store)?
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;
    Ok(Json(JobView { job }))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobView>>, AppErrorResponse> {
    let jobs = state
        .store
        .list_jobs(
            query.org_id.as_deref(),
            query.status,
            query.app_version_id.as_deref(),
            query.limit.unwrap_or(100),
        )
        .await
        .map_err(AppError::from_store)?;

    Ok(Json(jobs.into_iter().map(|job| JobView { job }).collect()))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Result<StatusCode, AppErrorResponse> {
    state.intake.cancel(id, body.reason).await?;
    Ok(StatusCode::OK)
}
