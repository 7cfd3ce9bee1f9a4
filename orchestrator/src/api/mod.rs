pub mod agents;
pub mod batches;
pub mod dto;
pub mod jobs;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::intake::Intake;
use crate::metrics::Counters;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::supervisor::LifecycleSupervisor;
use dto::{ErrorBody, ErrorDetail, MetricsResponse};

/// Everything an HTTP handler needs; cheap to clone since every field is
/// an `Arc`. Batcher, Scheduler, Supervisor, and Registry each receive a
/// Store handle and a Config record directly; there is no process-global
/// state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<AppConfig>,
    pub intake: Arc<Intake>,
    pub registry: Arc<AgentRegistry>,
    pub supervisor: Arc<LifecycleSupervisor>,
    pub counters: Counters,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit).get(jobs::list))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel))
        .route("/agents", post(agents::register))
        .route("/agents/:id/heartbeat", post(agents::heartbeat))
        .route("/agents/:id/poll", post(agents::poll))
        .route("/batches/:id/claim", post(batches::claim))
        .route("/batches/:id/progress", post(batches::progress))
        .route("/batches/:id/report", post(batches::report))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<MetricsResponse>, AppErrorResponse> {
    let counts = state.store.metrics_counts().await.map_err(AppError::from_store)?;
    let c = &state.counters;

    Ok(Json(MetricsResponse {
        pending_jobs: counts.pending_jobs,
        batched_jobs: counts.batched_jobs,
        running_jobs: counts.running_jobs,
        succeeded_jobs: counts.succeeded_jobs,
        failed_jobs: counts.failed_jobs,
        cancelled_jobs: counts.cancelled_jobs,
        pending_batches: counts.pending_batches,
        assigned_batches: counts.assigned_batches,
        running_batches: counts.running_batches,
        agents_online: counts.agents_online,
        agents_offline: counts.agents_offline,
        jobs_submitted: Counters::get(&c.jobs_submitted),
        jobs_rejected_validation: Counters::get(&c.jobs_rejected_validation),
        jobs_rejected_backpressure: Counters::get(&c.jobs_rejected_backpressure),
        jobs_deduped: Counters::get(&c.jobs_deduped),
        batches_sealed: Counters::get(&c.batches_sealed),
        dispatch_committed: Counters::get(&c.dispatch_committed),
        leases_reclaimed: Counters::get(&c.leases_reclaimed),
        deadlines_enforced: Counters::get(&c.deadlines_enforced),
    }))
}

/// Newtype so `AppError` (defined in the error-taxonomy module, shared by
/// non-HTTP callers) can implement `IntoResponse` without violating the
/// orphan rule.
pub struct AppErrorResponse(pub AppError);

impl From<AppError> for AppErrorResponse {
    fn from(e: AppError) -> Self {
        AppErrorResponse(e)
    }
}

impl IntoResponse for AppErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
