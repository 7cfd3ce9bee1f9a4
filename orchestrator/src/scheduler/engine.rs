use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::metrics::Counters;
use crate::model::agent::Agent;
use crate::model::audit::{Actor, AuditEntry};
use crate::model::batch::Batch;
use crate::scheduler::priority::effective_priority;
use crate::store::Store;
use crate::time::now_ms;

/// Selects the next batch to dispatch and the agent to dispatch it to:
/// round-robin across orgs, highest `effective_priority` within an org,
/// least-loaded eligible agent.
pub struct Scheduler {
    store: Arc<Store>,
    config: Arc<AppConfig>,
    counters: Counters,
    org_ring: Mutex<VecDeque<String>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, config: Arc<AppConfig>, counters: Counters) -> Self {
        Self {
            store,
            config,
            counters,
            org_ring: Mutex::new(VecDeque::new()),
        }
    }

    /// One scheduling sweep: keeps dispatching until either every org has
    /// been tried without success since the last success, or there is
    /// nothing left to dispatch.
    #[instrument(skip(self), target = "scheduler")]
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let pending = self.store.fetch_pending_batches().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut by_org: HashMap<String, Vec<Batch>> = HashMap::new();
        for batch in pending {
            by_org.entry(batch.org_id.clone()).or_default().push(batch);
        }

        self.sync_ring(by_org.keys());

        let ring_len = by_org.len().max(1);
        let mut dispatched = 0usize;
        let mut stale_rounds = 0usize;
        let now = now_ms();

        while stale_rounds < ring_len {
            let Some(org) = self.pop_front_org() else { break };
            let batches = by_org.get(&org).cloned().unwrap_or_default();

            if batches.is_empty() {
                self.push_back_org(org);
                stale_rounds += 1;
                continue;
            }

            match self.dispatch_best(&org, &batches, now).await? {
                Some(batch_id) => {
                    dispatched += 1;
                    stale_rounds = 0;
                    if let Some(remaining) = by_org.get_mut(&org) {
                        remaining.retain(|b| b.batch_id != batch_id);
                    }
                    self.push_back_org(org);
                }
                None => {
                    stale_rounds += 1;
                    self.push_back_org(org);
                }
            }
        }

        Ok(dispatched)
    }

    /// Picks the highest-`effective_priority` batch for this org (ties
    /// broken by `sealed_at` then `batch_id`), finds its least-loaded
    /// eligible agent, and commits the assignment. Falls through to the
    /// next-best batch on a CAS miss or agent shortage.
    async fn dispatch_best(&self, org_id: &str, batches: &[Batch], now: u64) -> anyhow::Result<Option<Uuid>> {
        let mut ranked: Vec<&Batch> = batches.iter().collect();
        ranked.sort_by(|a, b| {
            let age_a = now.saturating_sub(a.sealed_at) / 1000;
            let age_b = now.saturating_sub(b.sealed_at) / 1000;
            let ep_a = effective_priority(a.priority, age_a);
            let ep_b = effective_priority(b.priority, age_b);
            ep_b.cmp(&ep_a).then(a.sealed_at.cmp(&b.sealed_at)).then(a.batch_id.cmp(&b.batch_id))
        });

        for batch in ranked {
            Counters::inc(&self.counters.dispatch_attempts);
            let agents = self.store.fetch_eligible_agents(batch.target.as_str()).await?;
            let Some(agent) = pick_agent(&agents, batch) else {
                continue;
            };

            let committed = self
                .store
                .commit_assignment(batch.batch_id, agent.agent_id, now, self.config.lease_ms)
                .await?;

            if !committed {
                Counters::inc(&self.counters.dispatch_cas_miss);
                continue;
            }

            Counters::inc(&self.counters.dispatch_committed);
            self.store
                .append_audit(&AuditEntry::new(
                    "batch",
                    batch.batch_id,
                    Some("PENDING".to_string()),
                    "ASSIGNED",
                    Actor::System,
                    format!("assigned to agent {}", agent.agent_id),
                    now,
                ))
                .await?;

            info!(org_id, batch_id = %batch.batch_id, agent_id = %agent.agent_id, "batch assigned");
            return Ok(Some(batch.batch_id));
        }

        Ok(None)
    }

    fn sync_ring<'a>(&self, orgs: impl Iterator<Item = &'a String>) {
        let mut ring = self.org_ring.lock();
        let present: std::collections::HashSet<&String> = orgs.collect();

        ring.retain(|o| present.contains(o));
        let known: std::collections::HashSet<String> = ring.iter().cloned().collect();
        for org in present {
            if !known.contains(org) {
                ring.push_back(org.clone());
            }
        }
    }

    fn pop_front_org(&self) -> Option<String> {
        self.org_ring.lock().pop_front()
    }

    fn push_back_org(&self, org: String) {
        self.org_ring.lock().push_back(org);
    }
}

/// First eligible, least-loaded agent; ties broken by earliest
/// `last_heartbeat_at`.
fn pick_agent<'a>(agents: &'a [Agent], batch: &Batch) -> Option<&'a Agent> {
    agents
        .iter()
        .filter(|a| a.eligible_for(batch.target, &batch.device_requirements))
        .min_by(|a, b| {
            a.current_batch_ids
                .len()
                .cmp(&b.current_batch_ids.len())
                .then(a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::{AgentCapabilities, AgentStatus};
    use crate::model::job::{DeviceRequirements, Target};
    use std::collections::HashSet;

    fn mk_agent(current: usize, max: i32, last_heartbeat_at: u64) -> Agent {
        Agent {
            agent_id: Uuid::new_v4(),
            capabilities: AgentCapabilities {
                target: Target::Emulator,
                platform: "android".to_string(),
                device_type: "phone".to_string(),
                device_name: None,
                os_version: None,
            },
            max_concurrent_batches: max,
            current_batch_ids: (0..current).map(|_| Uuid::new_v4()).collect::<HashSet<_>>(),
            status: AgentStatus::Online,
            last_heartbeat_at,
            registered_at: 0,
            revision: 0,
        }
    }

    fn mk_batch() -> Batch {
        Batch {
            batch_id: Uuid::new_v4(),
            org_id: "qg".to_string(),
            app_version_id: "v1".to_string(),
            target: Target::Emulator,
            device_requirements: DeviceRequirements::default(),
            member_job_ids: vec![Uuid::new_v4()],
            priority: 5,
            effective_priority: 5000,
            state: crate::model::batch::BatchState::Pending,
            agent_id: None,
            assigned_at: None,
            started_at: None,
            deadline: None,
            lease_expires_at: None,
            sealed_at: 0,
            state_changed_at: 0,
            revision: 0,
        }
    }

    #[test]
    fn picks_least_loaded_agent() {
        let batch = mk_batch();
        let busy = mk_agent(3, 4, 100);
        let idle = mk_agent(0, 4, 50);
        let agents = vec![busy.clone(), idle.clone()];

        let picked = pick_agent(&agents, &batch).unwrap();
        assert_eq!(picked.agent_id, idle.agent_id);
    }

    #[test]
    fn ties_broken_by_earliest_heartbeat() {
        let batch = mk_batch();
        let later = mk_agent(0, 4, 200);
        let earlier = mk_agent(0, 4, 50);
        let agents = vec![later.clone(), earlier.clone()];

        let picked = pick_agent(&agents, &batch).unwrap();
        assert_eq!(picked.agent_id, earlier.agent_id);
    }

    #[test]
    fn agent_at_capacity_is_ineligible() {
        let batch = mk_batch();
        let full = mk_agent(4, 4, 0);
        let agents = vec![full];
        assert!(pick_agent(&agents, &batch).is_none());
    }
}
