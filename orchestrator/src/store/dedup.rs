use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

/// In-memory TTL cache over `client_request_id -> job_id`, default window
/// 10 minutes. The `dedup` table is the durable source of truth (every
/// insert is also written there via `JobRepository::insert_dedup`); this
/// cache only saves a round trip on the hot resubmission path and is safe
/// to lose on restart since `find_dedup` always has a fallback to the
/// durable row.
pub struct DedupCache {
    window_ms: u64,
    entries: Mutex<HashMap<String, (Uuid, u64)>>,
}

impl DedupCache {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, client_request_id: &str, now_ms: u64) -> Option<Uuid> {
        let entries = self.entries.lock();
        entries.get(client_request_id).and_then(|(job_id, at)| {
            if now_ms.saturating_sub(*at) <= self.window_ms {
                Some(*job_id)
            } else {
                None
            }
        })
    }

    pub fn insert(&self, client_request_id: String, job_id: Uuid, now_ms: u64) {
        self.entries.lock().insert(client_request_id, (job_id, now_ms));
    }

    /// Drops entries older than the idempotency window. Called from the same
    /// periodic sweeper that runs the lease/deadline sweeps.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, at)| now_ms.saturating_sub(*at) <= self.window_ms);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_within_window_is_returned() {
        let cache = DedupCache::new(10_000);
        let id = Uuid::new_v4();
        cache.insert("req-1".to_string(), id, 1_000);
        assert_eq!(cache.get("req-1", 5_000), Some(id));
    }

    #[test]
    fn entry_past_window_is_not_returned() {
        let cache = DedupCache::new(10_000);
        let id = Uuid::new_v4();
        cache.insert("req-1".to_string(), id, 1_000);
        assert_eq!(cache.get("req-1", 20_000), None);
    }

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let cache = DedupCache::new(10_000);
        cache.insert("old".to_string(), Uuid::new_v4(), 0);
        cache.insert("fresh".to_string(), Uuid::new_v4(), 19_000);

        let removed = cache.sweep_expired(20_000);
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }
}
