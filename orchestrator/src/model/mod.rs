pub mod agent;
pub mod audit;
pub mod batch;
pub mod job;

pub use agent::{Agent, AgentCapabilities, AgentStatus};
pub use audit::{Actor, AuditEntry};
pub use batch::{Batch, BatchState};
pub use job::{DeviceRequirements, Job, JobResult, JobState, Target};
