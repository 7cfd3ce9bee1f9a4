use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::model::job::Target;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub target: Target,
    pub platform: String,
    pub device_type: String,
    pub device_name: Option<String>,
    pub os_version: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
    Draining,
}

/// A registered executor that pulls batches via `poll`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub capabilities: AgentCapabilities,
    pub max_concurrent_batches: i32,
    pub current_batch_ids: HashSet<Uuid>,
    pub status: AgentStatus,
    pub last_heartbeat_at: u64,
    pub registered_at: u64,
    pub revision: i64,
}

impl Agent {
    /// OFFLINE if the liveness window has elapsed since the last heartbeat.
    pub fn is_live(&self, now_ms: u64, liveness_window_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_at) <= liveness_window_ms
    }

    /// `current_batch_ids` never exceeds `max_concurrent_batches`.
    pub fn has_capacity(&self) -> bool {
        (self.current_batch_ids.len() as i32) < self.max_concurrent_batches
    }

    /// Eligible iff ONLINE, has spare capacity, and capabilities satisfy
    /// the batch's `(target, device_requirements)`.
    pub fn eligible_for(
        &self,
        target: Target,
        requirements: &crate::model::job::DeviceRequirements,
    ) -> bool {
        self.status == AgentStatus::Online
            && self.has_capacity()
            && self.capabilities.target == target
            && (target == Target::Browserstack
                || requirements.satisfied_by(
                    &self.capabilities.platform,
                    &self.capabilities.device_type,
                    self.capabilities.os_version.as_deref(),
                ))
    }
}
