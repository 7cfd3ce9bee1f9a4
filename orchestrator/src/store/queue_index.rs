use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::model::job::Job;

/// Grouping key the Batcher and Scheduler both key off: jobs sharing one
/// are candidates for the same batch.
pub type GroupKey = (String, String, String);

fn group_key(job: &Job) -> GroupKey {
    (
        job.org_id.clone(),
        job.app_version_id.clone(),
        job.target.as_str().to_string(),
    )
}

/// In-memory secondary index over PENDING jobs, ordered
/// `(priority DESC, submitted_at ASC)` within each group so both the
/// Batcher's fill scan and the Scheduler's age calculation avoid a table
/// scan on the hot path.
///
/// Rebuilt from the Store on startup by replaying `fetch_non_terminal_jobs`
/// (scanning jobs in non-terminal states); the durable tables in
/// `store::repository_sqlx` remain the source of truth, this index is a
/// cache.
///
/// A map plus a round-robin ring, keyed by group instead of by individual
/// id, rotated to guarantee no single org starves another at the
/// Scheduler's selection step.
pub struct QueueIndex {
    groups: Mutex<HashMap<GroupKey, BTreeSet<(Reverse<i32>, u64, Uuid)>>>,
    rr: Mutex<VecDeque<GroupKey>>,
}

impl QueueIndex {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            rr: Mutex::new(VecDeque::new()),
        }
    }

    #[instrument(skip(self), target = "queue_index")]
    pub fn clear(&self) {
        self.groups.lock().clear();
        self.rr.lock().clear();
    }

    /// Seeds the index from a full scan; used once at startup.
    #[instrument(skip(self, jobs), target = "queue_index", fields(count = jobs.len()))]
    pub fn rebuild(&self, jobs: &[Job]) {
        self.clear();
        let mut inserted = 0usize;
        for job in jobs {
            if job.state == crate::model::job::JobState::Pending {
                self.insert(job);
                inserted += 1;
            }
        }
        info!(inserted, "queue index rebuilt from durable store");
    }

    /// Adds a PENDING job to its group. No-op if already present.
    pub fn insert(&self, job: &Job) {
        let key = group_key(job);
        let mut groups = self.groups.lock();
        let entry = groups.entry(key.clone()).or_insert_with(BTreeSet::new);
        entry.insert((Reverse(job.priority), job.submitted_at, job.job_id));
        drop(groups);

        let mut rr = self.rr.lock();
        if !rr.contains(&key) {
            rr.push_back(key);
        }
    }

    /// Removes a job from its group, e.g. once it has been sealed into a
    /// batch or cancelled. Drops the group from the rotation ring once
    /// empty so idle orgs don't dilute the round-robin.
    pub fn remove(&self, job: &Job) {
        let key = group_key(job);
        let mut groups = self.groups.lock();
        if let Some(set) = groups.get_mut(&key) {
            set.remove(&(Reverse(job.priority), job.submitted_at, job.job_id));
            if set.is_empty() {
                groups.remove(&key);
                drop(groups);
                self.rr.lock().retain(|k| k != &key);
                return;
            }
        }
    }

    /// Up to `limit` job ids for one group, highest priority and oldest
    /// first -- the Batcher's fill order.
    pub fn peek_group(&self, key: &GroupKey, limit: usize) -> Vec<Uuid> {
        self.groups
            .lock()
            .get(key)
            .map(|set| set.iter().take(limit).map(|(_, _, id)| *id).collect())
            .unwrap_or_default()
    }

    /// Non-empty group keys, in round-robin order starting after whichever
    /// group was returned last call. Rotating the ring on every call is
    /// what gives the Scheduler's org-fairness loop its guarantee: no group
    /// is visited twice before every other non-empty group has had a turn.
    pub fn rotate_groups(&self) -> Vec<GroupKey> {
        let mut rr = self.rr.lock();
        let n = rr.len();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(key) = rr.pop_front() {
                rr.push_back(key.clone());
                out.push(key);
            }
        }
        debug!(groups = out.len(), "rotated queue index group ring");
        out
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }
}

impl Default for QueueIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::{DeviceRequirements, JobState, Target};

    fn mk_job(org: &str, priority: i32, submitted_at: u64) -> Job {
        Job {
            job_id: Uuid::new_v4(),
            org_id: org.to_string(),
            app_version_id: "v1".to_string(),
            test_path: "tests/smoke.spec".to_string(),
            target: Target::Emulator,
            device_requirements: DeviceRequirements::default(),
            priority,
            timeout_ms: 60_000,
            retry_budget: 1,
            state: JobState::Pending,
            batch_id: None,
            attempt: 1,
            client_request_id: None,
            cancel_requested: false,
            submitted_at,
            state_changed_at: submitted_at,
            started_at: None,
            finished_at: None,
            retry_not_before: None,
            result: None,
            revision: 0,
        }
    }

    #[test]
    fn peek_group_orders_by_priority_then_age() {
        let idx = QueueIndex::new();
        let low = mk_job("acme", 1, 100);
        let high = mk_job("acme", 9, 200);
        idx.insert(&low);
        idx.insert(&high);

        let key = group_key(&high);
        let order = idx.peek_group(&key, 10);
        assert_eq!(order, vec![high.job_id, low.job_id]);
    }

    #[test]
    fn rotate_groups_round_robins_across_orgs() {
        let idx = QueueIndex::new();
        idx.insert(&mk_job("acme", 5, 0));
        idx.insert(&mk_job("globex", 5, 0));

        let first = idx.rotate_groups();
        let second = idx.rotate_groups();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second, "ring order is stable across calls with no mutation");
    }

    #[test]
    fn empty_group_is_dropped_from_ring() {
        let idx = QueueIndex::new();
        let job = mk_job("acme", 5, 0);
        idx.insert(&job);
        idx.remove(&job);

        assert_eq!(idx.group_count(), 0);
        assert!(idx.rotate_groups().is_empty());
    }
}
