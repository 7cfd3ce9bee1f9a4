use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide operational counters, cheap to clone (all fields are
/// `Arc<AtomicU64>`) and safe to share across the Batcher, Scheduler,
/// Supervisor, and API handlers.
#[derive(Clone, Default)]
pub struct Counters {
    pub jobs_submitted: Arc<AtomicU64>,
    pub jobs_rejected_validation: Arc<AtomicU64>,
    pub jobs_rejected_backpressure: Arc<AtomicU64>,
    pub jobs_deduped: Arc<AtomicU64>,

    pub batches_sealed: Arc<AtomicU64>,
    pub batches_sealed_urgent: Arc<AtomicU64>,
    pub batches_sealed_full: Arc<AtomicU64>,
    pub batches_sealed_aged: Arc<AtomicU64>,

    pub dispatch_attempts: Arc<AtomicU64>,
    pub dispatch_committed: Arc<AtomicU64>,
    pub dispatch_cas_miss: Arc<AtomicU64>,

    pub leases_reclaimed: Arc<AtomicU64>,
    pub deadlines_enforced: Arc<AtomicU64>,
    pub jobs_retried: Arc<AtomicU64>,

    pub agents_registered: Arc<AtomicU64>,
    pub agents_marked_offline: Arc<AtomicU64>,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
