use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Agent, AgentStatus, AuditEntry, Batch, Job, JobResult, JobState};

/// Durable persistence of jobs, batches, agents, and the audit log. Every
/// mutating method is a single transaction; callers never see a
/// partially-applied state transition.
///
/// A handful of coarse, domain-shaped operations rather than generic
/// CRUD, so that CAS preconditions live next to the SQL that enforces
/// them.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(
        &self,
        org_id: Option<&str>,
        state: Option<JobState>,
        app_version_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Count of jobs in non-terminal, not-yet-dispatched states; the
    /// admission-control signal Intake checks against `max_backlog`.
    async fn count_backlog(&self) -> Result<i64>;

    async fn find_dedup(&self, client_request_id: &str) -> Result<Option<Uuid>>;
    async fn insert_dedup(&self, client_request_id: &str, job_id: Uuid, now_ms: u64) -> Result<()>;

    /// Sets a PENDING or BATCHED job to CANCELLED immediately, or marks a
    /// RUNNING job cancel-requested (actual terminal transition awaits the
    /// agent report or lease expiry). Returns `None` if the job was not
    /// found or was already terminal.
    async fn request_cancel(
        &self,
        job_id: Uuid,
        reason: &str,
        now_ms: u64,
    ) -> Result<Option<CancelOutcome>>;

    /// Member job ids of `batch_id` that are cancel-requested, for
    /// surfacing to the agent on poll and heartbeat.
    async fn fetch_cancelled_member_ids(&self, batch_id: Uuid) -> Result<Vec<Uuid>>;

    /// Fetches PENDING jobs sharing a batching key, ordered
    /// `(priority DESC, submitted_at ASC)`, excluding jobs still in retry
    /// backoff. Used by the Batcher to fill a batch.
    async fn fetch_batchable(
        &self,
        org_id: &str,
        app_version_id: &str,
        target: &str,
        now_ms: u64,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Returns the distinct `(org_id, app_version_id, target)` keys that
    /// currently have at least one PENDING job, for the Batcher's sweep.
    async fn distinct_pending_keys(&self) -> Result<Vec<(String, String, String)>>;

    /// Atomically inserts the batch row and moves its member jobs
    /// PENDING -> BATCHED. Fails (returns `Ok(false)`) if any member is no
    /// longer PENDING (e.g. raced with a cancel).
    async fn seal_batch(&self, batch: &Batch) -> Result<bool>;

    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;
    async fn fetch_pending_batches(&self) -> Result<Vec<Batch>>;

    async fn fetch_eligible_agents(&self, target: &str) -> Result<Vec<Agent>>;

    /// The first ASSIGNED (not yet claimed) batch held by this agent, if
    /// any -- what `poll_for_assignment` hands back to the agent.
    async fn fetch_assigned_batch_for_agent(&self, agent_id: Uuid) -> Result<Option<Batch>>;

    /// Assignment commit: batch PENDING -> ASSIGNED, agent capacity
    /// incremented, in one transaction guarded by CAS preconditions on
    /// both rows. Returns `false` on a CAS miss (agent went offline, batch
    /// already assigned) rather than erroring.
    async fn commit_assignment(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool>;

    async fn register_agent(&self, agent: &Agent) -> Result<()>;
    async fn fetch_agent(&self, agent_id: Uuid) -> Result<Option<Agent>>;
    async fn heartbeat_agent(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_batch_ids: &[Uuid],
        now_ms: u64,
    ) -> Result<bool>;

    /// Flips agents whose heartbeat is older than `liveness_window_ms` to
    /// OFFLINE. Returns the ids that changed.
    async fn mark_stale_agents_offline(
        &self,
        liveness_window_ms: u64,
        now_ms: u64,
    ) -> Result<Vec<Uuid>>;

    /// ASSIGNED -> RUNNING on first successful `claim`; members
    /// BATCHED -> RUNNING; `deadline` set to `started_at + max(timeout_ms)`.
    async fn claim_batch(&self, batch_id: Uuid, agent_id: Uuid, now_ms: u64) -> Result<Option<Batch>>;

    /// Refreshes `lease_expires_at`; does not otherwise change state.
    async fn renew_lease(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool>;

    /// Idempotent per-job result recording: a repeated call with the same
    /// `(batch_id, job_id)` leaves the first-written result in place and
    /// still returns success.
    async fn record_result(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        result: JobResult,
        now_ms: u64,
    ) -> Result<()>;

    /// Batches whose `lease_expires_at` has passed: members are reclaimed
    /// (PENDING with backoff if retry budget remains, else FAILED with
    /// AGENT_LOST) and the agent's capacity is released. Returns the
    /// reclaimed batch ids.
    async fn sweep_expired_leases(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> Result<Vec<Uuid>>;

    /// RUNNING batches past `deadline`: still-running members fail with
    /// TIMEOUT. Returns the affected batch ids.
    async fn sweep_deadlines(&self, now_ms: u64) -> Result<Vec<Uuid>>;

    /// Startup recovery: reclaims ASSIGNED/RUNNING batches whose lease had
    /// already expired before the process restarted. Equivalent to
    /// `sweep_expired_leases` but run once before any scheduler tick is
    /// allowed.
    async fn recover_stuck_assignments(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> Result<usize>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// All non-terminal jobs, used to rebuild the in-memory queue index on
    /// startup by scanning jobs in non-terminal states.
    async fn fetch_non_terminal_jobs(&self) -> Result<Vec<Job>>;

    async fn metrics_counts(&self) -> Result<MetricsCounts>;
}

/// Outcome of a `request_cancel` call that actually matched a non-terminal
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// PENDING or BATCHED job moved straight to CANCELLED.
    Cancelled,
    /// RUNNING job flagged cancel-requested; still RUNNING until the agent
    /// reports a result or its lease expires.
    Requested,
}

#[derive(Debug, Default)]
pub struct MetricsCounts {
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
}
