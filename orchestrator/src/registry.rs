use std::sync::Arc;

use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::metrics::Counters;
use crate::model::agent::{Agent, AgentCapabilities, AgentStatus};
use crate::model::audit::{Actor, AuditEntry};
use crate::model::batch::Batch;
use crate::store::Store;
use crate::time::now_ms;
use tracing::{info, instrument};

/// Agent identity, capability, and liveness tracking.
pub struct AgentRegistry {
    store: Arc<Store>,
    config: Arc<AppConfig>,
    counters: Counters,
}

impl AgentRegistry {
    pub fn new(store: Arc<Store>, config: Arc<AppConfig>, counters: Counters) -> Self {
        Self { store, config, counters }
    }

    #[instrument(skip(self, capabilities), target = "registry")]
    pub async fn register(&self, capabilities: AgentCapabilities, max_concurrent_batches: i32) -> Result<Agent, AppError> {
        if max_concurrent_batches < 1 {
            return Err(AppError::Validation(vec![
                "max_concurrent_batches must be >= 1".to_string(),
            ]));
        }

        let now = now_ms();
        let agent = Agent {
            agent_id: Uuid::new_v4(),
            capabilities,
            max_concurrent_batches,
            current_batch_ids: Default::default(),
            status: AgentStatus::Online,
            last_heartbeat_at: now,
            registered_at: now,
            revision: 0,
        };

        self.store.register_agent(&agent).await.map_err(AppError::from_store)?;
        self.store
            .append_audit(&AuditEntry::new(
                "agent",
                agent.agent_id,
                None,
                "ONLINE",
                Actor::Agent,
                "registered",
                now,
            ))
            .await
            .map_err(AppError::from_store)?;

        Counters::inc(&self.counters.agents_registered);
        info!(agent_id = %agent.agent_id, "agent registered");
        Ok(agent)
    }

    /// Records liveness and, in the same round trip, reports back which of
    /// the agent's currently-held jobs have since been cancel-requested so
    /// it can stop running them before the lease or deadline sweep forces
    /// the issue.
    #[instrument(skip(self, current_batch_ids), target = "registry", fields(agent_id = %agent_id))]
    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_batch_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, AppError> {
        let now = now_ms();
        let updated = self
            .store
            .heartbeat_agent(agent_id, status, current_batch_ids, now)
            .await
            .map_err(AppError::from_store)?;

        if !updated {
            return Err(AppError::NotFound(format!("agent {agent_id} not found")));
        }

        let mut cancelled_job_ids = Vec::new();
        for batch_id in current_batch_ids {
            let ids = self
                .store
                .fetch_cancelled_member_ids(*batch_id)
                .await
                .map_err(AppError::from_store)?;
            cancelled_job_ids.extend(ids);
        }
        Ok(cancelled_job_ids)
    }

    /// Returns the agent's next unclaimed assignment, if any. Assignment
    /// itself happens on the Scheduler's own tick, not here; poll only
    /// surfaces what has already been committed.
    #[instrument(skip(self), target = "registry", fields(agent_id = %agent_id))]
    pub async fn poll(&self, agent_id: Uuid) -> Result<Option<Batch>, AppError> {
        let agent = self
            .store
            .fetch_agent(agent_id)
            .await
            .map_err(AppError::from_store)?
            .ok_or_else(|| AppError::NotFound(format!("agent {agent_id} not found")))?;

        if !agent.is_live(now_ms(), self.config.agent_liveness_window_ms) {
            return Err(AppError::Conflict(format!("agent {agent_id} is not live")));
        }

        self.store
            .fetch_assigned_batch_for_agent(agent_id)
            .await
            .map_err(AppError::from_store)
    }

    /// Periodic liveness sweep: flips agents past the heartbeat window to
    /// OFFLINE. Reclaiming their in-flight batches is the Supervisor's
    /// job, driven off the same `lease_expires_at` the heartbeat refreshes.
    #[instrument(skip(self), target = "registry")]
    pub async fn sweep_liveness(&self) -> anyhow::Result<usize> {
        let now = now_ms();
        let offline = self
            .store
            .mark_stale_agents_offline(self.config.agent_liveness_window_ms, now)
            .await?;

        for agent_id in &offline {
            self.store
                .append_audit(&AuditEntry::new(
                    "agent",
                    *agent_id,
                    Some("ONLINE".to_string()),
                    "OFFLINE",
                    Actor::System,
                    "missed heartbeat window",
                    now,
                ))
                .await?;
            Counters::inc(&self.counters.agents_marked_offline);
        }

        if !offline.is_empty() {
            info!(count = offline.len(), "agents marked offline for missed heartbeats");
        }
        Ok(offline.len())
    }
}
