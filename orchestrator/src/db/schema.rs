use sqlx::AnyPool;

/// Creates the persisted tables and secondary indexes.
///
/// Uses `CREATE TABLE IF NOT EXISTS` so it is safe to call on every
/// startup: plain `sqlx::query` DDL, no external migration framework.
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  app_version_id TEXT NOT NULL,
  test_path TEXT NOT NULL,
  target TEXT NOT NULL,
  device_requirements TEXT NOT NULL,

  priority INTEGER NOT NULL,
  timeout_ms BIGINT NOT NULL,
  retry_budget INTEGER NOT NULL,

  state TEXT NOT NULL,
  batch_id TEXT,
  attempt INTEGER NOT NULL,

  client_request_id TEXT,
  cancel_requested INTEGER NOT NULL DEFAULT 0,

  submitted_at BIGINT NOT NULL,
  state_changed_at BIGINT NOT NULL,
  started_at BIGINT,
  finished_at BIGINT,
  retry_not_before BIGINT,

  result_success INTEGER,
  result_counts TEXT,
  result_artifacts_uri TEXT,
  result_error_kind TEXT,
  result_error_message TEXT,

  revision BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS batches (
  batch_id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  app_version_id TEXT NOT NULL,
  target TEXT NOT NULL,
  device_requirements TEXT NOT NULL,

  member_job_ids TEXT NOT NULL,
  priority INTEGER NOT NULL,
  effective_priority BIGINT NOT NULL,

  state TEXT NOT NULL,
  agent_id TEXT,
  assigned_at BIGINT,
  started_at BIGINT,
  deadline BIGINT,
  lease_expires_at BIGINT,

  sealed_at BIGINT NOT NULL,
  state_changed_at BIGINT NOT NULL,
  revision BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  target TEXT NOT NULL,
  platform TEXT NOT NULL,
  device_type TEXT NOT NULL,
  device_name TEXT,
  os_version TEXT,

  max_concurrent_batches INTEGER NOT NULL,
  current_batch_ids TEXT NOT NULL,

  status TEXT NOT NULL,
  last_heartbeat_at BIGINT NOT NULL,
  registered_at BIGINT NOT NULL,
  revision BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS audit_log (
  audit_id TEXT PRIMARY KEY,
  entity_kind TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  from_state TEXT,
  to_state TEXT NOT NULL,
  actor TEXT NOT NULL,
  cause TEXT NOT NULL,
  at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS dedup (
  client_request_id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL,
  created_at BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_lookup ON jobs(state, target, app_version_id, org_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_batches_priority ON batches(state, effective_priority);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_agents_liveness ON agents(status, last_heartbeat_at);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs(batch_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
