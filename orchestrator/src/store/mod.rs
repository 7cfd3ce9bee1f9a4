pub mod dedup;
pub mod queue_index;
pub mod repository;
pub mod repository_sqlx;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::logger::warn_if_slow;
use crate::model::agent::{Agent, AgentStatus};
use crate::model::audit::AuditEntry;
use crate::model::batch::Batch;
use crate::model::job::{Job, JobResult, JobState};
use dedup::DedupCache;
use queue_index::{GroupKey, QueueIndex};
pub use repository::CancelOutcome;
use repository::{JobRepository, MetricsCounts};

/// The facade every service module (Intake, Batcher, Scheduler, Registry,
/// Supervisor) talks to. Owns the durable repository plus the two
/// in-memory caches layered in front of it, and is responsible for keeping
/// the queue index consistent with whatever the repository just
/// committed: the index is only updated after the backing transaction
/// commits, never speculatively.
///
/// A thin instrumented wrapper that adds caching and latency logging
/// around a trait-object repository.
pub struct Store {
    repo: Arc<dyn JobRepository>,
    queue: QueueIndex,
    dedup: DedupCache,
}

impl Store {
    pub fn new(repo: Arc<dyn JobRepository>, dedup_window_ms: u64) -> Self {
        Self {
            repo,
            queue: QueueIndex::new(),
            dedup: DedupCache::new(dedup_window_ms),
        }
    }

    pub fn queue(&self) -> &QueueIndex {
        &self.queue
    }

    /// Replays non-terminal jobs from the repository into the Queue Index.
    /// Must run once before the Batcher or Scheduler is allowed to tick.
    #[instrument(skip(self), target = "store")]
    pub async fn rebuild_queue_index(&self) -> Result<()> {
        let jobs = warn_if_slow("db_fetch_non_terminal_jobs", Duration::from_millis(200), async {
            self.repo.fetch_non_terminal_jobs().await
        })
        .await?;
        self.queue.rebuild(&jobs);
        Ok(())
    }

    #[instrument(skip(self, job), target = "store", fields(job_id = %job.job_id, org_id = %job.org_id))]
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        warn_if_slow("db_insert_job", Duration::from_millis(100), async {
            self.repo.insert_job(job).await
        })
        .await?;
        self.queue.insert(job);
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.repo.fetch_job(job_id).await
    }

    pub async fn list_jobs(
        &self,
        org_id: Option<&str>,
        state: Option<JobState>,
        app_version_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        self.repo.list_jobs(org_id, state, app_version_id, limit).await
    }

    pub async fn count_backlog(&self) -> Result<i64> {
        self.repo.count_backlog().await
    }

    #[instrument(skip(self), target = "store", fields(client_request_id))]
    pub async fn find_dedup(&self, client_request_id: &str, now_ms: u64) -> Result<Option<Uuid>> {
        if let Some(job_id) = self.dedup.get(client_request_id, now_ms) {
            return Ok(Some(job_id));
        }
        let found = self.repo.find_dedup(client_request_id).await?;
        if let Some(job_id) = found {
            self.dedup.insert(client_request_id.to_string(), job_id, now_ms);
        }
        Ok(found)
    }

    pub async fn insert_dedup(&self, client_request_id: &str, job_id: Uuid, now_ms: u64) -> Result<()> {
        self.repo.insert_dedup(client_request_id, job_id, now_ms).await?;
        self.dedup.insert(client_request_id.to_string(), job_id, now_ms);
        Ok(())
    }

    #[instrument(skip(self), target = "store", fields(job_id = %job_id))]
    pub async fn request_cancel(
        &self,
        job_id: Uuid,
        reason: &str,
        now_ms: u64,
    ) -> Result<Option<CancelOutcome>> {
        let outcome = self.repo.request_cancel(job_id, reason, now_ms).await?;
        if outcome == Some(CancelOutcome::Cancelled) {
            if let Some(job) = self.repo.fetch_job(job_id).await? {
                self.queue.remove(&job);
            }
        }
        Ok(outcome)
    }

    pub async fn fetch_cancelled_member_ids(&self, batch_id: Uuid) -> Result<Vec<Uuid>> {
        self.repo.fetch_cancelled_member_ids(batch_id).await
    }

    pub async fn fetch_batchable(
        &self,
        org_id: &str,
        app_version_id: &str,
        target: &str,
        now_ms: u64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        self.repo
            .fetch_batchable(org_id, app_version_id, target, now_ms, limit)
            .await
    }

    /// Non-empty group keys the Batcher should scan this tick, in
    /// round-robin order so no org is perpetually starved of a seal.
    pub fn rotate_pending_groups(&self) -> Vec<GroupKey> {
        self.queue.rotate_groups()
    }

    #[instrument(skip(self, batch), target = "store", fields(batch_id = %batch.batch_id, members = batch.member_job_ids.len()))]
    pub async fn seal_batch(&self, batch: &Batch) -> Result<bool> {
        let sealed = warn_if_slow("db_seal_batch", Duration::from_millis(150), async {
            self.repo.seal_batch(batch).await
        })
        .await?;

        if sealed {
            for job_id in &batch.member_job_ids {
                if let Some(job) = self.repo.fetch_job(*job_id).await? {
                    self.queue.remove(&job);
                }
            }
            info!(batch_id = %batch.batch_id, "batch sealed");
        }
        Ok(sealed)
    }

    pub async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        self.repo.fetch_batch(batch_id).await
    }

    pub async fn fetch_pending_batches(&self) -> Result<Vec<Batch>> {
        self.repo.fetch_pending_batches().await
    }

    pub async fn fetch_eligible_agents(&self, target: &str) -> Result<Vec<Agent>> {
        self.repo.fetch_eligible_agents(target).await
    }

    pub async fn fetch_assigned_batch_for_agent(&self, agent_id: Uuid) -> Result<Option<Batch>> {
        self.repo.fetch_assigned_batch_for_agent(agent_id).await
    }

    #[instrument(skip(self), target = "store", fields(batch_id = %batch_id, agent_id = %agent_id))]
    pub async fn commit_assignment(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool> {
        warn_if_slow("db_commit_assignment", Duration::from_millis(100), async {
            self.repo.commit_assignment(batch_id, agent_id, now_ms, lease_ms).await
        })
        .await
    }

    pub async fn register_agent(&self, agent: &Agent) -> Result<()> {
        self.repo.register_agent(agent).await
    }

    pub async fn fetch_agent(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        self.repo.fetch_agent(agent_id).await
    }

    pub async fn heartbeat_agent(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_batch_ids: &[Uuid],
        now_ms: u64,
    ) -> Result<bool> {
        self.repo.heartbeat_agent(agent_id, status, current_batch_ids, now_ms).await
    }

    pub async fn mark_stale_agents_offline(&self, liveness_window_ms: u64, now_ms: u64) -> Result<Vec<Uuid>> {
        self.repo.mark_stale_agents_offline(liveness_window_ms, now_ms).await
    }

    #[instrument(skip(self), target = "store", fields(batch_id = %batch_id, agent_id = %agent_id))]
    pub async fn claim_batch(&self, batch_id: Uuid, agent_id: Uuid, now_ms: u64) -> Result<Option<Batch>> {
        self.repo.claim_batch(batch_id, agent_id, now_ms).await
    }

    pub async fn renew_lease(&self, batch_id: Uuid, agent_id: Uuid, now_ms: u64, lease_ms: u64) -> Result<bool> {
        self.repo.renew_lease(batch_id, agent_id, now_ms, lease_ms).await
    }

    #[instrument(skip(self, result), target = "store", fields(batch_id = %batch_id, job_id = %job_id))]
    pub async fn record_result(&self, batch_id: Uuid, job_id: Uuid, result: JobResult, now_ms: u64) -> Result<()> {
        self.repo.record_result(batch_id, job_id, result, now_ms).await
    }

    /// Runs both sweepers and reinserts any job reclaimed to PENDING back
    /// into the Queue Index so the Batcher picks it up on its next tick.
    #[instrument(skip(self), target = "store")]
    pub async fn sweep(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> Result<SweepOutcome> {
        let reclaimed = self
            .repo
            .sweep_expired_leases(now_ms, retry_base_delay_ms, retry_max_delay_ms)
            .await?;
        let timed_out = self.repo.sweep_deadlines(now_ms).await?;

        self.resync_queue_for_batches(&reclaimed).await?;
        let removed_dedup = self.dedup.sweep_expired(now_ms);

        Ok(SweepOutcome {
            leases_reclaimed: reclaimed.len(),
            deadlines_enforced: timed_out.len(),
            dedup_entries_dropped: removed_dedup,
        })
    }

    #[instrument(skip(self), target = "store")]
    pub async fn recover_stuck_assignments(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> Result<usize> {
        let count = self
            .repo
            .recover_stuck_assignments(now_ms, retry_base_delay_ms, retry_max_delay_ms)
            .await?;
        if count > 0 {
            info!(count, "recovered batches stuck from a prior process lifetime");
        }
        Ok(count)
    }

    async fn resync_queue_for_batches(&self, batch_ids: &[Uuid]) -> Result<()> {
        for batch_id in batch_ids {
            if let Some(batch) = self.repo.fetch_batch(*batch_id).await? {
                for job_id in &batch.member_job_ids {
                    if let Some(job) = self.repo.fetch_job(*job_id).await? {
                        if job.state == JobState::Pending {
                            self.queue.insert(&job);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.repo.append_audit(entry).await
    }

    pub async fn metrics_counts(&self) -> Result<MetricsCounts> {
        self.repo.metrics_counts().await
    }
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub leases_reclaimed: usize,
    pub deadlines_enforced: usize,
    pub dedup_entries_dropped: usize,
}
