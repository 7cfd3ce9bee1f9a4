use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobErrorKind;

/// Coarse execution channel. A closed set; unknown strings are rejected at
/// Intake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Emulator,
    Device,
    Browserstack,
}

impl Target {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "emulator" => Some(Target::Emulator),
            "device" => Some(Target::Device),
            "browserstack" => Some(Target::Browserstack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Emulator => "emulator",
            Target::Device => "device",
            Target::Browserstack => "browserstack",
        }
    }
}

/// Structured predicate over the device an agent must provide. A range
/// bound of `None` means unconstrained on that axis.
///
/// `BrowserStack` device matching always trivially succeeds; the
/// orchestrator carries the fields but never evaluates them for that
/// target.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequirements {
    pub platform: Option<String>,
    pub device_type: Option<String>,
    pub min_os_version: Option<String>,
    pub max_os_version: Option<String>,
}

impl DeviceRequirements {
    /// Predicate intersection used by the Batcher's grouping key and the
    /// Agent Registry's eligibility check.
    /// Two requirement sets are compatible iff every constrained axis they
    /// both specify agrees; unconstrained axes never conflict.
    pub fn compatible(&self, other: &DeviceRequirements) -> bool {
        fn opt_eq(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }

        opt_eq(&self.platform, &other.platform) && opt_eq(&self.device_type, &other.device_type)
    }

    /// Whether a concrete agent capability set satisfies this predicate.
    pub fn satisfied_by(
        &self,
        platform: &str,
        device_type: &str,
        os_version: Option<&str>,
    ) -> bool {
        if let Some(p) = &self.platform {
            if p != platform {
                return false;
            }
        }
        if let Some(dt) = &self.device_type {
            if dt != device_type {
                return false;
            }
        }
        if let (Some(min), Some(v)) = (&self.min_os_version, os_version) {
            if version_lt(v, min) {
                return false;
            }
        }
        if let (Some(max), Some(v)) = (&self.max_os_version, os_version) {
            if version_lt(max, v) {
                return false;
            }
        }
        true
    }
}

/// Lexicographic dotted-version comparison (`"10" < "9"` is false, "9.1" <
/// "9.2" is true). Good enough for OS version ranges; not a full semver
/// implementation.
fn version_lt(a: &str, b: &str) -> bool {
    let pa: Vec<u64> = a.split('.').filter_map(|p| p.parse().ok()).collect();
    let pb: Vec<u64> = b.split('.').filter_map(|p| p.parse().ok()).collect();
    pa < pb
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Batched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub counts: serde_json::Value,
    pub artifacts_uri: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub error_message: Option<String>,
}

/// One submitted test execution request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    pub target: Target,
    pub device_requirements: DeviceRequirements,
    pub priority: i32,
    pub timeout_ms: u64,
    pub retry_budget: i32,

    pub state: JobState,
    pub batch_id: Option<Uuid>,
    pub attempt: i32,

    pub client_request_id: Option<String>,

    /// Set when a cancel is requested against a RUNNING job; the state
    /// itself only flips to CANCELLED once the agent reports a result or
    /// the lease expires.
    pub cancel_requested: bool,

    pub submitted_at: u64,
    pub state_changed_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    /// Set when a retryable failure withholds the job from batching until
    /// its exponential backoff window elapses.
    pub retry_not_before: Option<u64>,

    pub result: Option<JobResult>,

    /// Monotonically increasing, used for optimistic concurrency.
    pub revision: i64,
}

impl Job {
    /// `batch_id` is non-null iff the job's state has passed through BATCHED.
    pub fn batch_id_invariant_holds(&self) -> bool {
        let should_have_batch = matches!(
            self.state,
            JobState::Batched | JobState::Running | JobState::Succeeded | JobState::Failed
        );
        self.batch_id.is_some() == should_have_batch || self.state == JobState::Cancelled
    }

    /// `attempt` never exceeds `retry_budget + 1`.
    pub fn attempt_invariant_holds(&self) -> bool {
        self.attempt <= self.retry_budget + 1
    }
}
