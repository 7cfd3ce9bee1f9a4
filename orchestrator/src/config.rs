#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string (sqlite for dev/test, postgres in production).
    pub store_url: String,

    /// Address the HTTP API binds to, e.g. "0.0.0.0:8080".
    pub bind_addr: String,

    // =========================
    // Batcher configuration
    // =========================
    /// Maximum number of member jobs a single batch may hold.
    ///
    /// Bounds per-batch agent setup cost and per-assignment transaction size.
    pub max_batch_size: usize,

    /// Maximum time (ms) the oldest pending member of a batching key may wait
    /// before the batch is sealed regardless of size.
    ///
    /// Purpose: bound tail latency for low-traffic keys; too high and
    /// low-volume tenants starve waiting for a full batch.
    pub max_batch_wait_ms: u64,

    /// Priority at or above which a key's batch is sealed immediately,
    /// bypassing size and wait-window constraints.
    pub urgent_threshold: i32,

    // =========================
    // Scheduler / lease configuration
    // =========================
    /// Lease duration (ms) granted to an agent on assignment; heartbeats and
    /// progress reports extend it. If it elapses without renewal the batch
    /// is reclaimed.
    pub lease_ms: u64,

    /// Window (ms) after which a missed heartbeat flips an agent to OFFLINE.
    pub agent_liveness_window_ms: u64,

    /// Cadence (ms) of the expiry and deadline sweepers. Spec ceiling: 500 ms.
    pub sweep_interval_ms: u64,

    // =========================
    // Admission control
    // =========================
    /// Maximum number of PENDING batches system-wide before Intake returns
    /// BACKPRESSURE. The only place backpressure surfaces.
    pub max_backlog: usize,

    /// System ceiling (ms) for a submitted job's `timeout_ms`.
    pub max_timeout_ms: u64,

    /// Idempotency window (ms) for `client_request_id` dedup.
    pub dedup_window_ms: u64,

    // =========================
    // Retry policy
    // =========================
    /// Base delay (ms) for the first retry of a job whose attempt failed
    /// with a retryable error_kind.
    pub retry_base_delay_ms: u64,

    /// Ceiling (ms) the exponential retry backoff saturates at.
    pub retry_max_delay_ms: u64,

    // =========================
    // Shutdown
    // =========================
    /// How long (ms) graceful shutdown waits for in-flight API requests and
    /// supervised tasks to drain before the process exits.
    pub shutdown_grace_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            store_url: std::env::var("STORE_URL")
                .unwrap_or_else(|_| "sqlite://orchestrator_dev.db".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            max_batch_size: env_or("MAX_BATCH_SIZE", 16),
            max_batch_wait_ms: env_or("MAX_BATCH_WAIT_MS", 2_000),
            urgent_threshold: env_or("URGENT_THRESHOLD", 9),

            lease_ms: env_or("LEASE_MS", 60_000),
            agent_liveness_window_ms: env_or("AGENT_LIVENESS_WINDOW_MS", 90_000),
            sweep_interval_ms: env_or("SWEEP_INTERVAL_MS", 500),

            max_backlog: env_or("MAX_BACKLOG", 10_000),
            max_timeout_ms: env_or("MAX_TIMEOUT_MS", 3_600_000),
            dedup_window_ms: env_or("DEDUP_WINDOW_MS", 600_000),

            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", 1_000),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", 30_000),

            shutdown_grace_ms: env_or("SHUTDOWN_GRACE_MS", 5_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_when_env_unset() {
        // SAFETY: test-only, no concurrent env access in this process during the assertion.
        for key in [
            "MAX_BATCH_SIZE",
            "MAX_BATCH_WAIT_MS",
            "URGENT_THRESHOLD",
            "LEASE_MS",
            "AGENT_LIVENESS_WINDOW_MS",
            "SWEEP_INTERVAL_MS",
            "MAX_BACKLOG",
            "MAX_TIMEOUT_MS",
            "DEDUP_WINDOW_MS",
            "RETRY_BASE_DELAY_MS",
            "RETRY_MAX_DELAY_MS",
            "SHUTDOWN_GRACE_MS",
        ] {
            unsafe { std::env::remove_var(key) };
        }

        let cfg = AppConfig::from_env();
        assert_eq!(cfg.max_batch_size, 16);
        assert_eq!(cfg.max_batch_wait_ms, 2_000);
        assert_eq!(cfg.urgent_threshold, 9);
        assert_eq!(cfg.lease_ms, 60_000);
        assert_eq!(cfg.agent_liveness_window_ms, 90_000);
        assert_eq!(cfg.sweep_interval_ms, 500);
        assert_eq!(cfg.max_backlog, 10_000);
        assert_eq!(cfg.max_timeout_ms, 3_600_000);
        assert_eq!(cfg.dedup_window_ms, 600_000);
        assert_eq!(cfg.retry_base_delay_ms, 1_000);
        assert_eq!(cfg.retry_max_delay_ms, 30_000);
    }
}
