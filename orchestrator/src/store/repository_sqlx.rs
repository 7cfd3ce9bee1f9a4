use std::collections::HashSet;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::error::JobErrorKind;
use crate::model::agent::{Agent, AgentCapabilities, AgentStatus};
use crate::model::audit::AuditEntry;
use crate::model::batch::{Batch, BatchState};
use crate::model::job::{DeviceRequirements, Job, JobResult, JobState, Target};
use crate::store::repository::{CancelOutcome, JobRepository, MetricsCounts};

pub struct SqlxJobRepository {
    pool: AnyPool,
}

impl SqlxJobRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn job_state_str(s: JobState) -> &'static str {
    match s {
        JobState::Pending => "PENDING",
        JobState::Batched => "BATCHED",
        JobState::Running => "RUNNING",
        JobState::Succeeded => "SUCCEEDED",
        JobState::Failed => "FAILED",
        JobState::Cancelled => "CANCELLED",
    }
}

fn parse_job_state(s: &str) -> anyhow::Result<JobState> {
    Ok(match s {
        "PENDING" => JobState::Pending,
        "BATCHED" => JobState::Batched,
        "RUNNING" => JobState::Running,
        "SUCCEEDED" => JobState::Succeeded,
        "FAILED" => JobState::Failed,
        "CANCELLED" => JobState::Cancelled,
        other => return Err(anyhow!("unknown job state: {other}")),
    })
}

fn batch_state_str(s: BatchState) -> &'static str {
    match s {
        BatchState::Pending => "PENDING",
        BatchState::Assigned => "ASSIGNED",
        BatchState::Running => "RUNNING",
        BatchState::Done => "DONE",
        BatchState::Failed => "FAILED",
    }
}

fn parse_batch_state(s: &str) -> anyhow::Result<BatchState> {
    Ok(match s {
        "PENDING" => BatchState::Pending,
        "ASSIGNED" => BatchState::Assigned,
        "RUNNING" => BatchState::Running,
        "DONE" => BatchState::Done,
        "FAILED" => BatchState::Failed,
        other => return Err(anyhow!("unknown batch state: {other}")),
    })
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Online => "ONLINE",
        AgentStatus::Busy => "BUSY",
        AgentStatus::Offline => "OFFLINE",
        AgentStatus::Draining => "DRAINING",
    }
}

fn parse_agent_status(s: &str) -> anyhow::Result<AgentStatus> {
    Ok(match s {
        "ONLINE" => AgentStatus::Online,
        "BUSY" => AgentStatus::Busy,
        "OFFLINE" => AgentStatus::Offline,
        "DRAINING" => AgentStatus::Draining,
        other => return Err(anyhow!("unknown agent status: {other}")),
    })
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn row_to_job(r: &sqlx::any::AnyRow) -> anyhow::Result<Job> {
    let job_id = Uuid::parse_str(&r.get::<String, _>("job_id")).context("invalid job_id")?;
    let batch_id = r
        .get::<Option<String>, _>("batch_id")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .context("invalid batch_id")?;

    let device_requirements: DeviceRequirements =
        serde_json::from_str(&r.get::<String, _>("device_requirements"))
            .context("invalid device_requirements json")?;

    let result = if r.get::<Option<i64>, _>("result_success").is_some() {
        Some(JobResult {
            success: r.get::<i64, _>("result_success") != 0,
            counts: r
                .get::<Option<String>, _>("result_counts")
                .map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::Null))
                .unwrap_or(serde_json::Value::Null),
            artifacts_uri: r.get::<Option<String>, _>("result_artifacts_uri"),
            error_kind: r
                .get::<Option<String>, _>("result_error_kind")
                .and_then(|s| serde_json::from_str(&format!("\"{s}\"")).ok()),
            error_message: r.get::<Option<String>, _>("result_error_message"),
        })
    } else {
        None
    };

    Ok(Job {
        job_id,
        org_id: r.get("org_id"),
        app_version_id: r.get("app_version_id"),
        test_path: r.get("test_path"),
        target: Target::parse(&r.get::<String, _>("target"))
            .ok_or_else(|| anyhow!("unknown target"))?,
        device_requirements,
        priority: r.get::<i64, _>("priority") as i32,
        timeout_ms: i64_to_u64(r.get("timeout_ms"))?,
        retry_budget: r.get::<i64, _>("retry_budget") as i32,
        state: parse_job_state(&r.get::<String, _>("state"))?,
        batch_id,
        attempt: r.get::<i64, _>("attempt") as i32,
        client_request_id: r.get("client_request_id"),
        cancel_requested: r.get::<i64, _>("cancel_requested") != 0,
        submitted_at: i64_to_u64(r.get("submitted_at"))?,
        state_changed_at: i64_to_u64(r.get("state_changed_at"))?,
        started_at: r.get::<Option<i64>, _>("started_at").map(|v| v as u64),
        finished_at: r.get::<Option<i64>, _>("finished_at").map(|v| v as u64),
        retry_not_before: r.get::<Option<i64>, _>("retry_not_before").map(|v| v as u64),
        result,
        revision: r.get("revision"),
    })
}

fn row_to_batch(r: &sqlx::any::AnyRow) -> anyhow::Result<Batch> {
    let batch_id = Uuid::parse_str(&r.get::<String, _>("batch_id")).context("invalid batch_id")?;
    let member_job_ids: Vec<Uuid> = serde_json::from_str::<Vec<String>>(
        &r.get::<String, _>("member_job_ids"),
    )
    .context("invalid member_job_ids json")?
    .into_iter()
    .map(|s| Uuid::parse_str(&s))
    .collect::<Result<_, _>>()?;

    let device_requirements: DeviceRequirements =
        serde_json::from_str(&r.get::<String, _>("device_requirements"))
            .context("invalid device_requirements json")?;

    Ok(Batch {
        batch_id,
        org_id: r.get("org_id"),
        app_version_id: r.get("app_version_id"),
        target: Target::parse(&r.get::<String, _>("target"))
            .ok_or_else(|| anyhow!("unknown target"))?,
        device_requirements,
        member_job_ids,
        priority: r.get::<i64, _>("priority") as i32,
        effective_priority: r.get("effective_priority"),
        state: parse_batch_state(&r.get::<String, _>("state"))?,
        agent_id: r
            .get::<Option<String>, _>("agent_id")
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        assigned_at: r.get::<Option<i64>, _>("assigned_at").map(|v| v as u64),
        started_at: r.get::<Option<i64>, _>("started_at").map(|v| v as u64),
        deadline: r.get::<Option<i64>, _>("deadline").map(|v| v as u64),
        lease_expires_at: r.get::<Option<i64>, _>("lease_expires_at").map(|v| v as u64),
        sealed_at: i64_to_u64(r.get("sealed_at"))?,
        state_changed_at: i64_to_u64(r.get("state_changed_at"))?,
        revision: r.get("revision"),
    })
}

fn row_to_agent(r: &sqlx::any::AnyRow) -> anyhow::Result<Agent> {
    let agent_id = Uuid::parse_str(&r.get::<String, _>("agent_id")).context("invalid agent_id")?;
    let current_batch_ids: HashSet<Uuid> = serde_json::from_str::<Vec<String>>(
        &r.get::<String, _>("current_batch_ids"),
    )
    .context("invalid current_batch_ids json")?
    .into_iter()
    .map(|s| Uuid::parse_str(&s))
    .collect::<Result<_, _>>()?;

    Ok(Agent {
        agent_id,
        capabilities: AgentCapabilities {
            target: Target::parse(&r.get::<String, _>("target"))
                .ok_or_else(|| anyhow!("unknown target"))?,
            platform: r.get("platform"),
            device_type: r.get("device_type"),
            device_name: r.get("device_name"),
            os_version: r.get("os_version"),
        },
        max_concurrent_batches: r.get::<i64, _>("max_concurrent_batches") as i32,
        current_batch_ids,
        status: parse_agent_status(&r.get::<String, _>("status"))?,
        last_heartbeat_at: i64_to_u64(r.get("last_heartbeat_at"))?,
        registered_at: i64_to_u64(r.get("registered_at"))?,
        revision: r.get("revision"),
    })
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO jobs (
  job_id, org_id, app_version_id, test_path, target, device_requirements,
  priority, timeout_ms, retry_budget, state, batch_id, attempt,
  client_request_id, cancel_requested, submitted_at, state_changed_at, started_at, finished_at,
  retry_not_before, result_success, result_counts, result_artifacts_uri,
  result_error_kind, result_error_message, revision
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.org_id)
        .bind(&job.app_version_id)
        .bind(&job.test_path)
        .bind(job.target.as_str())
        .bind(serde_json::to_string(&job.device_requirements)?)
        .bind(job.priority as i64)
        .bind(u64_to_i64(job.timeout_ms)?)
        .bind(job.retry_budget as i64)
        .bind(job_state_str(job.state))
        .bind(job.batch_id.map(|b| b.to_string()))
        .bind(job.attempt as i64)
        .bind(&job.client_request_id)
        .bind(job.cancel_requested as i64)
        .bind(u64_to_i64(job.submitted_at)?)
        .bind(u64_to_i64(job.state_changed_at)?)
        .bind(job.started_at.map(|v| v as i64))
        .bind(job.finished_at.map(|v| v as i64))
        .bind(job.retry_not_before.map(|v| v as i64))
        .bind(None::<i64>)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(job.revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?;")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn list_jobs(
        &self,
        org_id: Option<&str>,
        state: Option<JobState>,
        app_version_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        // The `Any` driver does not support dynamic optional-predicate
        // query building well, so filter in-process after a bounded scan;
        // acceptable given the store's expected scale, not a multi-tenant
        // data warehouse.
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY submitted_at DESC LIMIT ?;")
            .bind(limit.max(1) * 8)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::new();
        for r in rows {
            let job = match row_to_job(&r) {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed job row");
                    continue;
                }
            };
            if let Some(o) = org_id {
                if job.org_id != o {
                    continue;
                }
            }
            if let Some(s) = state {
                if job.state != s {
                    continue;
                }
            }
            if let Some(a) = app_version_id {
                if job.app_version_id != a {
                    continue;
                }
            }
            out.push(job);
            if out.len() as i64 >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn count_backlog(&self) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM jobs WHERE state IN ('PENDING', 'BATCHED');",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("c"))
    }

    async fn find_dedup(&self, client_request_id: &str) -> anyhow::Result<Option<Uuid>> {
        let row = sqlx::query("SELECT job_id FROM dedup WHERE client_request_id = ?;")
            .bind(client_request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Uuid::parse_str(&r.get::<String, _>("job_id")).context("invalid job_id"))
            .transpose()
    }

    async fn insert_dedup(&self, client_request_id: &str, job_id: Uuid, now_ms: u64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO dedup (client_request_id, job_id, created_at) VALUES (?, ?, ?);",
        )
        .bind(client_request_id)
        .bind(job_id.to_string())
        .bind(u64_to_i64(now_ms)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_cancel(
        &self,
        job_id: Uuid,
        reason: &str,
        now_ms: u64,
    ) -> anyhow::Result<Option<CancelOutcome>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM jobs WHERE job_id = ?;")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let state = parse_job_state(&row.get::<String, _>("state"))?;
        if state.is_terminal() {
            tx.rollback().await?;
            return Ok(None);
        }

        let outcome = if matches!(state, JobState::Pending | JobState::Batched) {
            sqlx::query(
                r#"
UPDATE jobs
SET state = 'CANCELLED', state_changed_at = ?, finished_at = ?,
    result_success = 0, result_error_kind = 'CANCELLED', result_error_message = ?,
    revision = revision + 1
WHERE job_id = ?;
"#,
            )
            .bind(u64_to_i64(now_ms)?)
            .bind(u64_to_i64(now_ms)?)
            .bind(reason)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
            CancelOutcome::Cancelled
        } else {
            // RUNNING: the job only flips to CANCELLED once record_result
            // or a lease/deadline sweep observes the flag; poll and
            // heartbeat responses surface it to the agent in the meantime.
            sqlx::query(
                "UPDATE jobs SET cancel_requested = 1, state_changed_at = ?, revision = revision + 1 WHERE job_id = ?;",
            )
            .bind(u64_to_i64(now_ms)?)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
            CancelOutcome::Requested
        };

        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn fetch_cancelled_member_ids(&self, batch_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT job_id FROM jobs WHERE batch_id = ? AND cancel_requested = 1 AND state NOT IN ('CANCELLED');",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Uuid::parse_str(&r.get::<String, _>("job_id")).context("invalid job_id"))
            .collect()
    }

    async fn fetch_batchable(
        &self,
        org_id: &str,
        app_version_id: &str,
        target: &str,
        now_ms: u64,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
SELECT * FROM jobs
WHERE state = 'PENDING'
  AND org_id = ? AND app_version_id = ? AND target = ?
  AND (retry_not_before IS NULL OR retry_not_before <= ?)
ORDER BY priority DESC, submitted_at ASC
LIMIT ?;
"#,
        )
        .bind(org_id)
        .bind(app_version_id)
        .bind(target)
        .bind(u64_to_i64(now_ms)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn distinct_pending_keys(&self) -> anyhow::Result<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT org_id, app_version_id, target FROM jobs WHERE state = 'PENDING';",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("org_id"), r.get("app_version_id"), r.get("target")))
            .collect())
    }

    async fn seal_batch(&self, batch: &Batch) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        for job_id in &batch.member_job_ids {
            let res = sqlx::query(
                "UPDATE jobs SET state = 'BATCHED', batch_id = ?, state_changed_at = ?, revision = revision + 1 WHERE job_id = ? AND state = 'PENDING';",
            )
            .bind(batch.batch_id.to_string())
            .bind(u64_to_i64(batch.sealed_at)?)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() != 1 {
                tx.rollback().await?;
                tracing::warn!(batch_id = %batch.batch_id, job_id = %job_id, "seal_batch CAS miss; rolling back");
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
INSERT INTO batches (
  batch_id, org_id, app_version_id, target, device_requirements,
  member_job_ids, priority, effective_priority, state, agent_id,
  assigned_at, started_at, deadline, lease_expires_at, sealed_at,
  state_changed_at, revision
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', NULL, NULL, NULL, NULL, NULL, ?, ?, 0);
"#,
        )
        .bind(batch.batch_id.to_string())
        .bind(&batch.org_id)
        .bind(&batch.app_version_id)
        .bind(batch.target.as_str())
        .bind(serde_json::to_string(&batch.device_requirements)?)
        .bind(serde_json::to_string(
            &batch.member_job_ids.iter().map(|j| j.to_string()).collect::<Vec<_>>(),
        )?)
        .bind(batch.priority as i64)
        .bind(batch.effective_priority)
        .bind(u64_to_i64(batch.sealed_at)?)
        .bind(u64_to_i64(batch.state_changed_at)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> anyhow::Result<Option<Batch>> {
        let row = sqlx::query("SELECT * FROM batches WHERE batch_id = ?;")
            .bind(batch_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_batch(&r)).transpose()
    }

    async fn fetch_pending_batches(&self) -> anyhow::Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches WHERE state = 'PENDING';")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_batch).collect()
    }

    async fn fetch_eligible_agents(&self, target: &str) -> anyhow::Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE target = ? AND status = 'ONLINE';")
            .bind(target)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn fetch_assigned_batch_for_agent(&self, agent_id: Uuid) -> anyhow::Result<Option<Batch>> {
        let row = sqlx::query(
            "SELECT * FROM batches WHERE agent_id = ? AND state = 'ASSIGNED' ORDER BY assigned_at ASC LIMIT 1;",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_batch(&r)).transpose()
    }

    async fn commit_assignment(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        now_ms: u64,
        lease_ms: u64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let agent_row = sqlx::query("SELECT current_batch_ids, max_concurrent_batches, status FROM agents WHERE agent_id = ?;")
            .bind(agent_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(agent_row) = agent_row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let status: String = agent_row.get("status");
        if status != "ONLINE" {
            tx.rollback().await?;
            return Ok(false);
        }

        let max_concurrent: i64 = agent_row.get("max_concurrent_batches");
        let mut current_batch_ids: Vec<String> =
            serde_json::from_str(&agent_row.get::<String, _>("current_batch_ids"))?;

        if current_batch_ids.len() as i64 >= max_concurrent {
            tx.rollback().await?;
            return Ok(false);
        }
        current_batch_ids.push(batch_id.to_string());

        let batch_res = sqlx::query(
            "UPDATE batches SET state = 'ASSIGNED', agent_id = ?, assigned_at = ?, lease_expires_at = ?, state_changed_at = ?, revision = revision + 1 WHERE batch_id = ? AND state = 'PENDING';",
        )
        .bind(agent_id.to_string())
        .bind(u64_to_i64(now_ms)?)
        .bind(u64_to_i64(now_ms + lease_ms)?)
        .bind(u64_to_i64(now_ms)?)
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        if batch_res.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE agents SET current_batch_ids = ?, revision = revision + 1 WHERE agent_id = ?;",
        )
        .bind(serde_json::to_string(&current_batch_ids)?)
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn register_agent(&self, agent: &Agent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO agents (
  agent_id, target, platform, device_type, device_name, os_version,
  max_concurrent_batches, current_batch_ids, status, last_heartbeat_at,
  registered_at, revision
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0);
"#,
        )
        .bind(agent.agent_id.to_string())
        .bind(agent.capabilities.target.as_str())
        .bind(&agent.capabilities.platform)
        .bind(&agent.capabilities.device_type)
        .bind(&agent.capabilities.device_name)
        .bind(&agent.capabilities.os_version)
        .bind(agent.max_concurrent_batches as i64)
        .bind(serde_json::to_string(&Vec::<String>::new())?)
        .bind(agent_status_str(agent.status))
        .bind(u64_to_i64(agent.last_heartbeat_at)?)
        .bind(u64_to_i64(agent.registered_at)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_agent(&self, agent_id: Uuid) -> anyhow::Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?;")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_agent(&r)).transpose()
    }

    async fn heartbeat_agent(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_batch_ids: &[Uuid],
        now_ms: u64,
    ) -> anyhow::Result<bool> {
        let ids: Vec<String> = current_batch_ids.iter().map(|u| u.to_string()).collect();
        let res = sqlx::query(
            "UPDATE agents SET status = ?, current_batch_ids = ?, last_heartbeat_at = ?, revision = revision + 1 WHERE agent_id = ?;",
        )
        .bind(agent_status_str(status))
        .bind(serde_json::to_string(&ids)?)
        .bind(u64_to_i64(now_ms)?)
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_stale_agents_offline(
        &self,
        liveness_window_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<Vec<Uuid>> {
        let cutoff = now_ms.saturating_sub(liveness_window_ms);
        let rows = sqlx::query(
            "SELECT agent_id FROM agents WHERE status != 'OFFLINE' AND last_heartbeat_at < ?;",
        )
        .bind(u64_to_i64(cutoff)?)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for r in rows {
            let id_str: String = r.get("agent_id");
            sqlx::query("UPDATE agents SET status = 'OFFLINE', revision = revision + 1 WHERE agent_id = ?;")
                .bind(&id_str)
                .execute(&self.pool)
                .await?;
            out.push(Uuid::parse_str(&id_str)?);
        }
        Ok(out)
    }

    async fn claim_batch(&self, batch_id: Uuid, agent_id: Uuid, now_ms: u64) -> anyhow::Result<Option<Batch>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM batches WHERE batch_id = ? AND agent_id = ? AND state = 'ASSIGNED';")
            .bind(batch_id.to_string())
            .bind(agent_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let batch = row_to_batch(&row)?;

        let mut max_timeout: u64 = 0;
        for job_id in &batch.member_job_ids {
            let jr = sqlx::query("SELECT timeout_ms FROM jobs WHERE job_id = ?;")
                .bind(job_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
            max_timeout = max_timeout.max(i64_to_u64(jr.get("timeout_ms"))?);

            sqlx::query("UPDATE jobs SET state = 'RUNNING', started_at = ?, state_changed_at = ?, revision = revision + 1 WHERE job_id = ? AND state = 'BATCHED';")
                .bind(u64_to_i64(now_ms)?)
                .bind(u64_to_i64(now_ms)?)
                .bind(job_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let deadline = now_ms + max_timeout;

        sqlx::query(
            "UPDATE batches SET state = 'RUNNING', started_at = ?, deadline = ?, state_changed_at = ?, revision = revision + 1 WHERE batch_id = ?;",
        )
        .bind(u64_to_i64(now_ms)?)
        .bind(u64_to_i64(deadline)?)
        .bind(u64_to_i64(now_ms)?)
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(self.fetch_batch(batch_id).await?)
    }

    async fn renew_lease(
        &self,
        batch_id: Uuid,
        agent_id: Uuid,
        now_ms: u64,
        lease_ms: u64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE batches SET lease_expires_at = ?, revision = revision + 1 WHERE batch_id = ? AND agent_id = ? AND state IN ('ASSIGNED', 'RUNNING');",
        )
        .bind(u64_to_i64(now_ms + lease_ms)?)
        .bind(batch_id.to_string())
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn record_result(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        result: JobResult,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, cancel_requested FROM jobs WHERE job_id = ? AND batch_id = ?;")
            .bind(job_id.to_string())
            .bind(batch_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(anyhow!("job {job_id} not found in batch {batch_id}"));
        };

        let state = parse_job_state(&row.get::<String, _>("state"))?;
        if state.is_terminal() {
            // Idempotent: first write wins.
            tx.commit().await?;
            return Ok(());
        }

        let cancel_requested: i64 = row.get("cancel_requested");
        if cancel_requested != 0 {
            sqlx::query(
                r#"
UPDATE jobs
SET state = 'CANCELLED', finished_at = ?, state_changed_at = ?,
    result_success = 0, result_error_kind = 'CANCELLED',
    result_error_message = 'cancelled while running', revision = revision + 1
WHERE job_id = ?;
"#,
            )
            .bind(u64_to_i64(now_ms)?)
            .bind(u64_to_i64(now_ms)?)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            let final_state = if result.success {
                JobState::Succeeded
            } else {
                JobState::Failed
            };

            sqlx::query(
                r#"
UPDATE jobs
SET state = ?, finished_at = ?, state_changed_at = ?,
    result_success = ?, result_counts = ?, result_artifacts_uri = ?,
    result_error_kind = ?, result_error_message = ?, revision = revision + 1
WHERE job_id = ?;
"#,
            )
            .bind(job_state_str(final_state))
            .bind(u64_to_i64(now_ms)?)
            .bind(u64_to_i64(now_ms)?)
            .bind(if result.success { 1 } else { 0 })
            .bind(serde_json::to_string(&result.counts)?)
            .bind(&result.artifacts_uri)
            .bind(result.error_kind.map(|k| k.to_string()))
            .bind(&result.error_message)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        // If every member of the batch is now terminal, close the batch.
        let batch_row = sqlx::query("SELECT member_job_ids, agent_id FROM batches WHERE batch_id = ?;")
            .bind(batch_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let member_ids: Vec<String> = serde_json::from_str(&batch_row.get::<String, _>("member_job_ids"))?;

        let remaining = sqlx::query(
            "SELECT COUNT(*) AS c FROM jobs WHERE batch_id = ? AND state IN ('RUNNING', 'BATCHED');",
        )
        .bind(batch_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        let remaining: i64 = remaining.get("c");

        if remaining == 0 && !member_ids.is_empty() {
            let any_failed = sqlx::query(
                "SELECT COUNT(*) AS c FROM jobs WHERE batch_id = ? AND state = 'FAILED';",
            )
            .bind(batch_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
            let any_failed: i64 = any_failed.get("c");

            let new_state = if any_failed > 0 { "FAILED" } else { "DONE" };
            sqlx::query("UPDATE batches SET state = ?, state_changed_at = ?, revision = revision + 1 WHERE batch_id = ?;")
                .bind(new_state)
                .bind(u64_to_i64(now_ms)?)
                .bind(batch_id.to_string())
                .execute(&mut *tx)
                .await?;

            if let Some(agent_id_str) = batch_row.get::<Option<String>, _>("agent_id") {
                release_agent_capacity(&mut tx, &agent_id_str, batch_id).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn sweep_expired_leases(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT batch_id FROM batches WHERE state IN ('ASSIGNED', 'RUNNING') AND lease_expires_at < ?;",
        )
        .bind(u64_to_i64(now_ms)?)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::new();
        for r in rows {
            let batch_id = Uuid::parse_str(&r.get::<String, _>("batch_id"))?;
            self.reclaim_batch(batch_id, now_ms, retry_base_delay_ms, retry_max_delay_ms, JobErrorKind::AgentLost)
                .await?;
            reclaimed.push(batch_id);
        }
        Ok(reclaimed)
    }

    async fn sweep_deadlines(&self, now_ms: u64) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT batch_id FROM batches WHERE state = 'RUNNING' AND deadline < ?;")
            .bind(u64_to_i64(now_ms)?)
            .fetch_all(&self.pool)
            .await?;

        let mut affected = Vec::new();
        for r in rows {
            let batch_id = Uuid::parse_str(&r.get::<String, _>("batch_id"))?;
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
UPDATE jobs SET state = 'FAILED', finished_at = ?, state_changed_at = ?,
  result_success = 0, result_error_kind = 'TIMEOUT', result_error_message = 'deadline exceeded',
  revision = revision + 1
WHERE batch_id = ? AND state = 'RUNNING';
"#,
            )
            .bind(u64_to_i64(now_ms)?)
            .bind(u64_to_i64(now_ms)?)
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

            let batch_row = sqlx::query("SELECT agent_id FROM batches WHERE batch_id = ?;")
                .bind(batch_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query("UPDATE batches SET state = 'FAILED', state_changed_at = ?, revision = revision + 1 WHERE batch_id = ?;")
                .bind(u64_to_i64(now_ms)?)
                .bind(batch_id.to_string())
                .execute(&mut *tx)
                .await?;

            if let Some(agent_id_str) = batch_row.get::<Option<String>, _>("agent_id") {
                release_agent_capacity(&mut tx, &agent_id_str, batch_id).await?;
            }

            tx.commit().await?;
            affected.push(batch_id);
        }
        Ok(affected)
    }

    async fn recover_stuck_assignments(
        &self,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
    ) -> anyhow::Result<usize> {
        let reclaimed = self
            .sweep_expired_leases(now_ms, retry_base_delay_ms, retry_max_delay_ms)
            .await?;
        Ok(reclaimed.len())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (audit_id, entity_kind, entity_id, from_state, to_state, actor, cause, at_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(entry.audit_id.to_string())
        .bind(entry.entity_kind)
        .bind(entry.entity_id.to_string())
        .bind(&entry.from_state)
        .bind(&entry.to_state)
        .bind(serde_json::to_string(&entry.actor)?.trim_matches('"').to_string())
        .bind(&entry.cause)
        .bind(u64_to_i64(entry.at_ms)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_non_terminal_jobs(&self) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state IN ('PENDING', 'BATCHED', 'RUNNING');",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn metrics_counts(&self) -> anyhow::Result<MetricsCounts> {
        async fn count(pool: &AnyPool, sql: &str) -> anyhow::Result<i64> {
            let row = sqlx::query(sql).fetch_one(pool).await?;
            Ok(row.get::<i64, _>("c"))
        }

        Ok(MetricsCounts {
            pending_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'PENDING';").await?,
            batched_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'BATCHED';").await?,
            running_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'RUNNING';").await?,
            succeeded_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'SUCCEEDED';").await?,
            failed_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'FAILED';").await?,
            cancelled_jobs: count(&self.pool, "SELECT COUNT(*) AS c FROM jobs WHERE state = 'CANCELLED';").await?,
            pending_batches: count(&self.pool, "SELECT COUNT(*) AS c FROM batches WHERE state = 'PENDING';").await?,
            assigned_batches: count(&self.pool, "SELECT COUNT(*) AS c FROM batches WHERE state = 'ASSIGNED';").await?,
            running_batches: count(&self.pool, "SELECT COUNT(*) AS c FROM batches WHERE state = 'RUNNING';").await?,
            agents_online: count(&self.pool, "SELECT COUNT(*) AS c FROM agents WHERE status = 'ONLINE';").await?,
            agents_offline: count(&self.pool, "SELECT COUNT(*) AS c FROM agents WHERE status = 'OFFLINE';").await?,
        })
    }
}

impl SqlxJobRepository {
    /// Shared reclaim path used by both the expiry sweeper and startup
    /// crash recovery: unreported members follow the AGENT_LOST path;
    /// reported members keep their result.
    async fn reclaim_batch(
        &self,
        batch_id: Uuid,
        now_ms: u64,
        retry_base_delay_ms: u64,
        retry_max_delay_ms: u64,
        kind: JobErrorKind,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let batch_row = sqlx::query("SELECT agent_id FROM batches WHERE batch_id = ?;")
            .bind(batch_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(batch_row) = batch_row else {
            tx.rollback().await?;
            return Ok(());
        };

        let unresolved = sqlx::query(
            "SELECT job_id, attempt, retry_budget, cancel_requested FROM jobs WHERE batch_id = ? AND state IN ('BATCHED', 'RUNNING');",
        )
        .bind(batch_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        for r in &unresolved {
            let job_id: String = r.get("job_id");
            let attempt: i64 = r.get("attempt");
            let retry_budget: i64 = r.get("retry_budget");
            let cancel_requested: i64 = r.get("cancel_requested");

            if cancel_requested != 0 {
                sqlx::query(
                    "UPDATE jobs SET state = 'CANCELLED', finished_at = ?, state_changed_at = ?, result_success = 0, result_error_kind = 'CANCELLED', result_error_message = 'cancelled while running', revision = revision + 1 WHERE job_id = ?;",
                )
                .bind(u64_to_i64(now_ms)?)
                .bind(u64_to_i64(now_ms)?)
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
            } else if attempt < retry_budget {
                let shift = (attempt as u32).min(63);
                let delay = retry_base_delay_ms
                    .saturating_mul(1u64 << shift)
                    .min(retry_max_delay_ms);
                sqlx::query(
                    "UPDATE jobs SET state = 'PENDING', batch_id = NULL, attempt = attempt + 1, retry_not_before = ?, state_changed_at = ?, revision = revision + 1 WHERE job_id = ?;",
                )
                .bind(u64_to_i64(now_ms + delay)?)
                .bind(u64_to_i64(now_ms)?)
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE jobs SET state = 'FAILED', finished_at = ?, state_changed_at = ?, result_success = 0, result_error_kind = ?, result_error_message = 'agent lease lost', revision = revision + 1 WHERE job_id = ?;",
                )
                .bind(u64_to_i64(now_ms)?)
                .bind(u64_to_i64(now_ms)?)
                .bind(kind.to_string())
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE batches SET state = 'FAILED', state_changed_at = ?, revision = revision + 1 WHERE batch_id = ?;")
            .bind(u64_to_i64(now_ms)?)
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

        if let Some(agent_id_str) = batch_row.get::<Option<String>, _>("agent_id") {
            release_agent_capacity(&mut tx, &agent_id_str, batch_id).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn release_agent_capacity(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    agent_id_str: &str,
    batch_id: Uuid,
) -> anyhow::Result<()> {
    let row = sqlx::query("SELECT current_batch_ids FROM agents WHERE agent_id = ?;")
        .bind(agent_id_str)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else { return Ok(()) };

    let mut ids: Vec<String> = serde_json::from_str(&row.get::<String, _>("current_batch_ids"))?;
    ids.retain(|id| id != &batch_id.to_string());

    sqlx::query("UPDATE agents SET current_batch_ids = ?, revision = revision + 1 WHERE agent_id = ?;")
        .bind(serde_json::to_string(&ids)?)
        .bind(agent_id_str)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
