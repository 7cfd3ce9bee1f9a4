use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use uuid::Uuid;

use crate::model::batch::Batch;

use super::dto::{ClaimRequest, ProgressRequest, ReportRequest};
use super::{AppErrorResponse, AppState};

pub async fn claim(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<Batch>, AppErrorResponse> {
    let batch = state.supervisor.claim(id, body.agent_id).await?;
    Ok(Json(batch))
}

pub async fn progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressRequest>,
) -> Result<StatusCode, AppErrorResponse> {
    state.supervisor.progress(id, body.agent_id, body.progress).await?;
    Ok(StatusCode::OK)
}

pub async fn report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReportRequest>,
) -> Result<StatusCode, AppErrorResponse> {
    let results = body.results.into_iter().map(|r| (r.job_id, r.result)).collect();
    state.supervisor.report(id, body.agent_id, results).await?;
    Ok(StatusCode::OK)
}
