use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::logger::{annotate_span, warn_if_slow};
use crate::metrics::Counters;
use crate::model::audit::{Actor, AuditEntry};
use crate::model::job::{DeviceRequirements, Job, JobState, Target};
use crate::store::{CancelOutcome, Store};
use crate::time::now_ms;

/// Untyped wire payload for `POST /jobs`, validated into a `Job` at the
/// boundary.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct SubmitPayload {
    pub org_id: String,
    pub app_version_id: String,
    pub test_path: String,
    pub target: String,
    #[serde(default)]
    pub device_requirements: DeviceRequirements,
    pub priority: i32,
    pub timeout_ms: u64,
    pub retry_budget: i32,
    pub client_request_id: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    pub queue_position: usize,
    pub estimated_start: Option<u64>,
}

fn validate_payload(payload: &SubmitPayload, max_timeout_ms: u64) -> Result<Target, Vec<String>> {
    let mut errors = Vec::new();

    if payload.org_id.trim().is_empty() {
        errors.push("org_id must not be empty".to_string());
    }
    if payload.app_version_id.trim().is_empty() {
        errors.push("app_version_id must not be empty".to_string());
    }
    if payload.test_path.trim().is_empty() {
        errors.push("test_path must not be empty".to_string());
    }

    let target = Target::parse(&payload.target);
    if target.is_none() {
        errors.push(format!(
            "target must be one of emulator/device/browserstack, got {:?}",
            payload.target
        ));
    }

    if !(1..=10).contains(&payload.priority) {
        errors.push(format!("priority must be in [1, 10], got {}", payload.priority));
    }

    if payload.timeout_ms == 0 || payload.timeout_ms > max_timeout_ms {
        errors.push(format!(
            "timeout_ms must be in (0, {}], got {}",
            max_timeout_ms, payload.timeout_ms
        ));
    }

    if !(0..=5).contains(&payload.retry_budget) {
        errors.push(format!("retry_budget must be in [0, 5], got {}", payload.retry_budget));
    }

    match target {
        Some(t) if errors.is_empty() => Ok(t),
        _ => Err(errors),
    }
}

/// Validation, idempotency, admission control, and persistence of new jobs.
pub struct Intake {
    store: Arc<Store>,
    config: Arc<AppConfig>,
    counters: Counters,
}

impl Intake {
    pub fn new(store: Arc<Store>, config: Arc<AppConfig>, counters: Counters) -> Self {
        Self { store, config, counters }
    }

    fn validate(&self, payload: &SubmitPayload) -> Result<Target, Vec<String>> {
        validate_payload(payload, self.config.max_timeout_ms)
    }

    #[instrument(skip(self, payload), target = "intake", fields(org_id = %payload.org_id, job_id))]
    pub async fn submit(&self, payload: SubmitPayload) -> Result<SubmitOutcome, AppError> {
        let now = now_ms();

        if let Some(client_request_id) = &payload.client_request_id {
            let existing = self
                .store
                .find_dedup(client_request_id, now)
                .await
                .map_err(AppError::from_store)?;
            if let Some(job_id) = existing {
                Counters::inc(&self.counters.jobs_deduped);
                let job = self
                    .store
                    .fetch_job(job_id)
                    .await
                    .map_err(AppError::from_store)?
                    .ok_or_else(|| AppError::Internal("dedup pointed at missing job".to_string()))?;
                info!(job_id = %job_id, "duplicate submission short-circuited");
                return Ok(SubmitOutcome {
                    job_id: job.job_id,
                    state: job.state,
                    queue_position: 0,
                    estimated_start: None,
                });
            }
        }

        let target = self.validate(&payload).map_err(|errors| {
            Counters::inc(&self.counters.jobs_rejected_validation);
            AppError::Validation(errors)
        })?;

        let backlog = self.store.count_backlog().await.map_err(AppError::from_store)?;
        if backlog as usize >= self.config.max_backlog {
            Counters::inc(&self.counters.jobs_rejected_backpressure);
            warn!(backlog, max_backlog = self.config.max_backlog, "admission control rejected submission");
            return Err(AppError::Backpressure(format!(
                "pending backlog {backlog} at or above max_backlog {}",
                self.config.max_backlog
            )));
        }

        let job_id = Uuid::new_v4();
        annotate_span(Some(&payload.org_id), Some(&job_id), None, None);

        let job = Job {
            job_id,
            org_id: payload.org_id.clone(),
            app_version_id: payload.app_version_id,
            test_path: payload.test_path,
            target,
            device_requirements: payload.device_requirements,
            priority: payload.priority,
            timeout_ms: payload.timeout_ms,
            retry_budget: payload.retry_budget,
            state: JobState::Pending,
            batch_id: None,
            attempt: 0,
            client_request_id: payload.client_request_id.clone(),
            cancel_requested: false,
            submitted_at: now,
            state_changed_at: now,
            started_at: None,
            finished_at: None,
            retry_not_before: None,
            result: None,
            revision: 0,
        };

        warn_if_slow("intake_insert_job", Duration::from_millis(150), async {
            self.store.insert_job(&job).await
        })
        .await
        .map_err(AppError::from_store)?;

        if let Some(client_request_id) = &payload.client_request_id {
            self.store
                .insert_dedup(client_request_id, job_id, now)
                .await
                .map_err(AppError::from_store)?;
        }

        self.store
            .append_audit(&AuditEntry::new(
                "job",
                job_id,
                None,
                "PENDING",
                Actor::Api,
                "submitted",
                now,
            ))
            .await
            .map_err(AppError::from_store)?;

        Counters::inc(&self.counters.jobs_submitted);
        info!("job accepted");

        Ok(SubmitOutcome {
            job_id,
            state: JobState::Pending,
            queue_position: backlog as usize + 1,
            estimated_start: None,
        })
    }

    #[instrument(skip(self), target = "intake", fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: Uuid, reason: String) -> Result<(), AppError> {
        let now = now_ms();
        let job = self
            .store
            .fetch_job(job_id)
            .await
            .map_err(AppError::from_store)?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))?;

        if job.state.is_terminal() {
            return Err(AppError::Conflict(format!(
                "job {job_id} already in terminal state {:?}",
                job.state
            )));
        }

        let outcome = self
            .store
            .request_cancel(job_id, &reason, now)
            .await
            .map_err(AppError::from_store)?;

        match outcome {
            Some(CancelOutcome::Cancelled) => {
                self.store
                    .append_audit(&AuditEntry::new(
                        "job",
                        job_id,
                        Some(format!("{:?}", job.state).to_uppercase()),
                        "CANCELLED",
                        Actor::Api,
                        reason,
                        now,
                    ))
                    .await
                    .map_err(AppError::from_store)?;
            }
            Some(CancelOutcome::Requested) => {
                self.store
                    .append_audit(&AuditEntry::new(
                        "job",
                        job_id,
                        Some("RUNNING".to_string()),
                        "RUNNING",
                        Actor::Api,
                        format!("cancel requested: {reason}"),
                        now,
                    ))
                    .await
                    .map_err(AppError::from_store)?;
            }
            None => {
                return Err(AppError::Conflict(format!(
                    "job {job_id} already in terminal state {:?}",
                    job.state
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_payload() -> SubmitPayload {
        SubmitPayload {
            org_id: "qg".to_string(),
            app_version_id: "v1".to_string(),
            test_path: "t.spec".to_string(),
            target: "emulator".to_string(),
            device_requirements: DeviceRequirements::default(),
            priority: 5,
            timeout_ms: 60_000,
            retry_budget: 0,
            client_request_id: None,
        }
    }

    #[test]
    fn rejects_all_invalid_fields_at_once() {
        let mut payload = mk_payload();
        payload.org_id = "".to_string();
        payload.priority = 99;
        payload.timeout_ms = 0;
        payload.retry_budget = -1;
        payload.target = "laptop".to_string();

        let errors = validate_payload(&payload, 3_600_000).unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn accepts_well_formed_payload() {
        let payload = mk_payload();
        assert!(validate_payload(&payload, 3_600_000).is_ok());
    }

    #[test]
    fn rejects_timeout_above_ceiling() {
        let mut payload = mk_payload();
        payload.timeout_ms = 10_000_000;
        let errors = validate_payload(&payload, 3_600_000).unwrap_err();
        assert_eq!(errors.len(), 1);
    }
}
