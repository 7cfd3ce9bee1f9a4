use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    System,
    Agent,
    Api,
}

/// Append-only record of every state transition, job or batch.
/// Used for crash recovery and for proving idempotent writes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub entity_kind: &'static str,
    pub entity_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub actor: Actor,
    pub cause: String,
    pub at_ms: u64,
}

impl AuditEntry {
    pub fn new(
        entity_kind: &'static str,
        entity_id: Uuid,
        from_state: Option<String>,
        to_state: impl Into<String>,
        actor: Actor,
        cause: impl Into<String>,
        at_ms: u64,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            from_state,
            to_state: to_state.into(),
            actor,
            cause: cause.into(),
            at_ms,
        }
    }
}
