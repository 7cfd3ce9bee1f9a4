use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::metrics::Counters;
use crate::model::audit::{Actor, AuditEntry};
use crate::model::batch::{Batch, BatchState};
use crate::model::job::Job;
use crate::store::Store;
use crate::time::now_ms;

/// Groups pending jobs sharing `(org_id, app_version_id, target)` and a
/// compatible `device_requirements` intersection into batches, sealing
/// them once a size, wait-window, or urgency threshold is crossed.
pub struct Batcher {
    store: Arc<Store>,
    config: Arc<AppConfig>,
    counters: Counters,
}

impl Batcher {
    pub fn new(store: Arc<Store>, config: Arc<AppConfig>, counters: Counters) -> Self {
        Self { store, config, counters }
    }

    /// One pass over every group with pending work. Called on a timer and
    /// whenever Intake wakes the Batcher with a fresh submission.
    #[instrument(skip(self), target = "batcher")]
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let groups = self.store.rotate_pending_groups();
        let mut sealed = 0;

        for (org_id, app_version_id, target) in groups {
            sealed += self.seal_ready_clusters(&org_id, &app_version_id, &target).await?;
        }

        Ok(sealed)
    }

    async fn seal_ready_clusters(
        &self,
        org_id: &str,
        app_version_id: &str,
        target: &str,
    ) -> anyhow::Result<usize> {
        let now = now_ms();
        let fetch_limit = (self.config.max_batch_size as i64) * 8;
        let candidates = self
            .store
            .fetch_batchable(org_id, app_version_id, target, now, fetch_limit)
            .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        let clusters = cluster_by_device_compatibility(candidates);
        let mut sealed_count = 0;

        for cluster in clusters {
            if let Some(reason) = self.seal_reason(&cluster, now) {
                let members: Vec<Job> = cluster.into_iter().take(self.config.max_batch_size).collect();
                if self.seal(org_id, app_version_id, target, members, now, reason).await? {
                    sealed_count += 1;
                }
            }
        }

        Ok(sealed_count)
    }

    /// Returns why a cluster should seal now, or `None` if it should keep
    /// accumulating members.
    fn seal_reason(&self, cluster: &[Job], now: u64) -> Option<SealReason> {
        if cluster.len() >= self.config.max_batch_size {
            return Some(SealReason::Full);
        }

        let highest_priority = cluster.iter().map(|j| j.priority).max().unwrap_or(0);
        if highest_priority >= self.config.urgent_threshold {
            return Some(SealReason::Urgent);
        }

        let oldest_submitted_at = cluster.iter().map(|j| j.submitted_at).min().unwrap_or(now);
        if now.saturating_sub(oldest_submitted_at) >= self.config.max_batch_wait_ms {
            return Some(SealReason::Aged);
        }

        None
    }

    #[instrument(skip(self, members), target = "batcher", fields(org_id, app_version_id, target, members = members.len()))]
    async fn seal(
        &self,
        org_id: &str,
        app_version_id: &str,
        target: &str,
        mut members: Vec<Job>,
        now: u64,
        reason: SealReason,
    ) -> anyhow::Result<bool> {
        // Member ordering inside the batch mirrors submission (input) order,
        // independent of the priority-first order used to pick which jobs
        // to include.
        members.sort_by_key(|j| j.submitted_at);

        let priority = members.iter().map(|j| j.priority).max().unwrap_or(1);
        let device_requirements = members[0].device_requirements.clone();
        let batch_id = Uuid::new_v4();

        let batch = Batch {
            batch_id,
            org_id: org_id.to_string(),
            app_version_id: app_version_id.to_string(),
            target: members[0].target,
            device_requirements,
            member_job_ids: members.iter().map(|j| j.job_id).collect(),
            priority,
            effective_priority: (priority as i64) * 1000,
            state: BatchState::Pending,
            agent_id: None,
            assigned_at: None,
            started_at: None,
            deadline: None,
            lease_expires_at: None,
            sealed_at: now,
            state_changed_at: now,
            revision: 0,
        };

        let sealed = self.store.seal_batch(&batch).await?;
        if !sealed {
            // Raced with a cancel on one of the members; the next tick
            // will re-cluster whatever is still PENDING.
            return Ok(false);
        }

        self.store
            .append_audit(&AuditEntry::new(
                "batch",
                batch_id,
                None,
                "PENDING",
                Actor::System,
                format!("sealed: {reason:?}"),
                now,
            ))
            .await?;

        match reason {
            SealReason::Urgent => Counters::inc(&self.counters.batches_sealed_urgent),
            SealReason::Full => Counters::inc(&self.counters.batches_sealed_full),
            SealReason::Aged => Counters::inc(&self.counters.batches_sealed_aged),
        }
        Counters::inc(&self.counters.batches_sealed);

        info!(batch_id = %batch_id, reason = ?reason, members = batch.member_job_ids.len(), "batch sealed");
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug)]
enum SealReason {
    Full,
    Urgent,
    Aged,
}

/// Splits a priority/age-ordered candidate list into clusters whose members
/// are pairwise compatible under `DeviceRequirements::compatible`. Each
/// cluster is represented by its first (highest-priority, oldest) member;
/// later jobs join the first cluster they are compatible with, else start
/// a new one. Clusters preserve the input order of their members.
fn cluster_by_device_compatibility(candidates: Vec<Job>) -> Vec<Vec<Job>> {
    let mut clusters: Vec<Vec<Job>> = Vec::new();

    for job in candidates {
        let slot = clusters
            .iter()
            .position(|cluster| cluster[0].device_requirements.compatible(&job.device_requirements));

        match slot {
            Some(idx) => clusters[idx].push(job),
            None => clusters.push(vec![job]),
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::{DeviceRequirements, JobState, Target};

    fn mk_job(priority: i32, submitted_at: u64, platform: Option<&str>) -> Job {
        Job {
            job_id: Uuid::new_v4(),
            org_id: "qg".to_string(),
            app_version_id: "v1".to_string(),
            test_path: "t.spec".to_string(),
            target: Target::Emulator,
            device_requirements: DeviceRequirements {
                platform: platform.map(|s| s.to_string()),
                ..Default::default()
            },
            priority,
            timeout_ms: 60_000,
            retry_budget: 0,
            state: JobState::Pending,
            batch_id: None,
            attempt: 0,
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
    fn incompatible_device_requirements_split_into_separate_clusters() {
        let jobs = vec![
            mk_job(5, 0, Some("android")),
            mk_job(5, 1, Some("ios")),
            mk_job(5, 2, Some("android")),
        ];
        let clusters = cluster_by_device_compatibility(jobs);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
        assert_eq!(clusters[1].len(), 1);
    }

    #[test]
    fn unconstrained_requirements_join_any_cluster() {
        let jobs = vec![mk_job(5, 0, Some("android")), mk_job(5, 1, None)];
        let clusters = cluster_by_device_compatibility(jobs);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::job::{DeviceRequirements, JobState, Target};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn job_with(platform: Option<String>, priority: i32, submitted_at: u64) -> Job {
        Job {
            job_id: Uuid::new_v4(),
            org_id: "qg".to_string(),
            app_version_id: "v1".to_string(),
            test_path: "t.spec".to_string(),
            target: Target::Emulator,
            device_requirements: DeviceRequirements { platform, ..Default::default() },
            priority,
            timeout_ms: 60_000,
            retry_budget: 0,
            state: JobState::Pending,
            batch_id: None,
            attempt: 0,
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

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]
        #[test]
        fn test_clustering_invariants(
            platforms in prop::collection::vec(prop::option::of(0..3u8), 1..30),
            priority in 1..=10i32,
        ) {
            let jobs: Vec<Job> = platforms
                .into_iter()
                .enumerate()
                .map(|(i, p)| job_with(p.map(|n| n.to_string()), priority, i as u64))
                .collect();
            let job_ids: BTreeSet<Uuid> = jobs.iter().map(|j| j.job_id).collect();
            let input_len = jobs.len();

            let clusters = cluster_by_device_compatibility(jobs);

            // --- INVARIANT 1: every input job appears in exactly one cluster ---
            let clustered_ids: BTreeSet<Uuid> = clusters.iter().flatten().map(|j| j.job_id).collect();
            assert_eq!(clustered_ids, job_ids);
            assert_eq!(clusters.iter().map(|c| c.len()).sum::<usize>(), input_len);

            // --- INVARIANT 2: no more clusters than distinct platform constraints ---
            assert!(clusters.len() <= input_len.max(1));

            // --- INVARIANT 3: every member is compatible with its cluster's anchor ---
            for cluster in &clusters {
                let anchor = &cluster[0].device_requirements;
                for job in cluster {
                    assert!(anchor.compatible(&job.device_requirements));
                }
            }
        }
    }
}
