use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::metrics::Counters;
use crate::model::audit::{Actor, AuditEntry};
use crate::model::batch::Batch;
use crate::model::job::JobResult;
use crate::store::Store;
use crate::time::now_ms;

/// Best-effort per-job progress snapshot reported between claim and report.
/// Stored nowhere durable today -- it only refreshes the lease -- but is a
/// distinct wire shape from the terminal `JobResult`.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub note: Option<String>,
}

/// Drives an ASSIGNED batch through RUNNING to a terminal state: claim,
/// progress, report, plus the two periodic sweepers.
pub struct LifecycleSupervisor {
    store: Arc<Store>,
    config: Arc<AppConfig>,
    counters: Counters,
}

impl LifecycleSupervisor {
    pub fn new(store: Arc<Store>, config: Arc<AppConfig>, counters: Counters) -> Self {
        Self { store, config, counters }
    }

    #[instrument(skip(self), target = "supervisor", fields(batch_id = %batch_id, agent_id = %agent_id))]
    pub async fn claim(&self, batch_id: Uuid, agent_id: Uuid) -> Result<Batch, AppError> {
        let now = now_ms();
        let batch = self
            .store
            .claim_batch(batch_id, agent_id, now)
            .await
            .map_err(AppError::from_store)?
            .ok_or_else(|| AppError::Conflict(format!("batch {batch_id} is not ASSIGNED to agent {agent_id}")))?;

        self.store
            .append_audit(&AuditEntry::new(
                "batch",
                batch_id,
                Some("ASSIGNED".to_string()),
                "RUNNING",
                Actor::Agent,
                "claimed",
                now,
            ))
            .await
            .map_err(AppError::from_store)?;

        info!(batch_id = %batch_id, agent_id = %agent_id, "batch claimed");
        Ok(batch)
    }

    #[instrument(skip(self, _progress), target = "supervisor", fields(batch_id = %batch_id, agent_id = %agent_id))]
    pub async fn progress(&self, batch_id: Uuid, agent_id: Uuid, _progress: Vec<JobProgress>) -> Result<(), AppError> {
        let renewed = self
            .store
            .renew_lease(batch_id, agent_id, now_ms(), self.config.lease_ms)
            .await
            .map_err(AppError::from_store)?;

        if !renewed {
            return Err(AppError::Conflict(format!(
                "batch {batch_id} is not held by agent {agent_id}"
            )));
        }
        Ok(())
    }

    /// Records each member's result. A repeated result for a job already
    /// terminal is a no-op success, not a conflict.
    #[instrument(skip(self, results), target = "supervisor", fields(batch_id = %batch_id, agent_id = %agent_id, members = results.len()))]
    pub async fn report(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        results: Vec<(Uuid, JobResult)>,
    ) -> Result<(), AppError> {
        let batch = self
            .store
            .fetch_batch(batch_id)
            .await
            .map_err(AppError::from_store)?
            .ok_or_else(|| AppError::NotFound(format!("batch {batch_id} not found")))?;

        if batch.agent_id != Some(agent_id) {
            return Err(AppError::Conflict(format!(
                "batch {batch_id} is not held by agent {agent_id}"
            )));
        }

        let now = now_ms();
        for (job_id, result) in results {
            self.store
                .record_result(batch_id, job_id, result, now)
                .await
                .map_err(AppError::from_store)?;

            // record_result overrides a cancel-requested job to CANCELLED
            // regardless of what the agent reported, so re-fetch rather than
            // trust the reported outcome for the audit entry.
            let to_state = match self.store.fetch_job(job_id).await.map_err(AppError::from_store)? {
                Some(job) => format!("{:?}", job.state).to_uppercase(),
                None => continue,
            };

            self.store
                .append_audit(&AuditEntry::new(
                    "job",
                    job_id,
                    Some("RUNNING".to_string()),
                    to_state,
                    Actor::Agent,
                    "result reported",
                    now,
                ))
                .await
                .map_err(AppError::from_store)?;
        }

        Ok(())
    }

    /// Runs the expiry and deadline sweepers once. Called on a timer no
    /// coarser than `sweep_interval_ms` (ceiling 500 ms).
    #[instrument(skip(self), target = "supervisor")]
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let now = now_ms();
        let outcome = self
            .store
            .sweep(now, self.config.retry_base_delay_ms, self.config.retry_max_delay_ms)
            .await?;

        for _ in 0..outcome.leases_reclaimed {
            Counters::inc(&self.counters.leases_reclaimed);
        }
        for _ in 0..outcome.deadlines_enforced {
            Counters::inc(&self.counters.deadlines_enforced);
        }

        if outcome.leases_reclaimed > 0 || outcome.deadlines_enforced > 0 {
            info!(
                leases_reclaimed = outcome.leases_reclaimed,
                deadlines_enforced = outcome.deadlines_enforced,
                "sweep completed"
            );
        }
        Ok(())
    }

    /// Startup crash recovery: must run once, before the Scheduler's first
    /// tick, so no stale ASSIGNED/RUNNING batch from a prior process
    /// lifetime is left un-reclaimed.
    #[instrument(skip(self), target = "supervisor")]
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let now = now_ms();
        self.store
            .recover_stuck_assignments(now, self.config.retry_base_delay_ms, self.config.retry_max_delay_ms)
            .await
    }
}
