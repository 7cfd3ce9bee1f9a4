use thiserror::Error;

/// Internal error taxonomy, mapped to HTTP responses at the API boundary.
///
/// Store-layer code returns `anyhow::Result` (see `store::repository_sqlx`)
/// so that error context can be chained cheaply; service-layer code
/// (Intake, Batcher, Scheduler, Supervisor, API handlers) converts into
/// this enum, which is the only error type that crosses the HTTP boundary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Backpressure(_) => "BACKPRESSURE",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Backpressure(_) => 429,
            AppError::StoreUnavailable(_) => 503,
            AppError::Internal(_) => 500,
        }
    }

    pub fn from_store(e: anyhow::Error) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

/// Per-job terminal failure classification. This is domain data persisted
/// on the job record, not a control-flow error, so it lives in a separate
/// enum from `AppError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorKind {
    TestFailure,
    Timeout,
    AgentLost,
    Infrastructure,
    Cancelled,
}

impl JobErrorKind {
    /// Whether a job that failed with this kind is eligible for retry,
    /// subject to remaining `retry_budget`. TEST_FAILURE and TIMEOUT are
    /// both terminal by design; only AGENT_LOST and INFRASTRUCTURE warrant
    /// another attempt.
    pub fn retryable(self) -> bool {
        matches!(self, JobErrorKind::AgentLost | JobErrorKind::Infrastructure)
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobErrorKind::TestFailure => "TEST_FAILURE",
            JobErrorKind::Timeout => "TIMEOUT",
            JobErrorKind::AgentLost => "AGENT_LOST",
            JobErrorKind::Infrastructure => "INFRASTRUCTURE",
            JobErrorKind::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
