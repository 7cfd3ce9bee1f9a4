use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::agent::Agent;

use super::dto::{AssignmentView, HeartbeatAck, HeartbeatRequest, RegisterAgentRequest};
use super::{AppErrorResponse, AppState};

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<Agent>), AppErrorResponse> {
    let agent = state
        .registry
        .register(body.capabilities, body.max_concurrent_batches)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatAck>, AppErrorResponse> {
    let cancelled_job_ids = state
        .registry
        .heartbeat(id, body.status, &body.current_batch_ids)
        .await?;
    Ok(Json(HeartbeatAck { cancelled_job_ids }))
}

pub async fn poll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<AssignmentView>>, AppErrorResponse> {
    let assignment = state.registry.poll(id).await?;
    let view = match assignment {
        Some(batch) => {
            let cancelled_job_ids = state
                .store
                .fetch_cancelled_member_ids(batch.batch_id)
                .await
                .map_err(AppError::from_store)?;
            Some(AssignmentView { batch, cancelled_job_ids })
        }
        None => None,
    };
    Ok(Json(view))
}
