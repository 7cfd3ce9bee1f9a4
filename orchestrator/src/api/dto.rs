use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::agent::AgentCapabilities;
use crate::model::batch::Batch;
use crate::model::job::{Job, JobResult, JobState};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub org_id: Option<String>,
    pub status: Option<JobState>,
    pub app_version_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub capabilities: AgentCapabilities,
    pub max_concurrent_batches: i32,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: crate::model::agent::AgentStatus,
    #[serde(default)]
    pub current_batch_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatAck {
    pub cancelled_job_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub agent_id: Uuid,
    #[serde(default)]
    pub progress: Vec<crate::supervisor::JobProgress>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: Uuid,
}

/// A batch assignment as seen by the agent, annotated with which members
/// (if any) have since been cancel-requested and should not be run.
#[derive(Debug, Serialize)]
pub struct AssignmentView {
    #[serde(flatten)]
    pub batch: Batch,
    pub cancelled_job_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub agent_id: Uuid,
    pub results: Vec<JobResultEntry>,
}

#[derive(Debug, Deserialize)]
pub struct JobResultEntry {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub result: JobResult,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub pending_jobs: i64,
    pub batched_jobs: i64,
    pub running_jobs: i64,
    pub succeeded_jobs: i64,
    pub failed_jobs: i64,
    pub cancelled_jobs: i64,
    pub pending_batches: i64,
    pub assigned_batches: i64,
    pub running_batches: i64,
    pub agents_online: i64,
    pub agents_offline: i64,

    pub jobs_submitted: u64,
    pub jobs_rejected_validation: u64,
    pub jobs_rejected_backpressure: u64,
    pub jobs_deduped: u64,
    pub batches_sealed: u64,
    pub dispatch_committed: u64,
    pub leases_reclaimed: u64,
    pub deadlines_enforced: u64,
}
