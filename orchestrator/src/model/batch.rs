use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::job::{DeviceRequirements, Target};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Assigned,
    Running,
    Done,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Done | BatchState::Failed)
    }
}

/// The unit actually scheduled. All members share
/// `(org_id, app_version_id, target)` and a compatible `device_requirements`
/// intersection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub org_id: String,
    pub app_version_id: String,
    pub target: Target,
    pub device_requirements: DeviceRequirements,

    pub member_job_ids: Vec<Uuid>,
    pub priority: i32,
    pub effective_priority: i64,

    pub state: BatchState,
    pub agent_id: Option<Uuid>,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub deadline: Option<u64>,
    pub lease_expires_at: Option<u64>,

    pub sealed_at: u64,
    pub state_changed_at: u64,
    pub revision: i64,
}

impl Batch {
    /// A batch references exactly one agent while ASSIGNED/RUNNING.
    pub fn agent_invariant_holds(&self) -> bool {
        match self.state {
            BatchState::Assigned | BatchState::Running => self.agent_id.is_some(),
            _ => true,
        }
    }
}
