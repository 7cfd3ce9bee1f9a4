use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use orchestrator::api::{self, AppState};
use orchestrator::config::AppConfig;
use orchestrator::db::schema;
use orchestrator::intake::Intake;
use orchestrator::metrics::Counters;
use orchestrator::registry::AgentRegistry;
use orchestrator::store::repository_sqlx::SqlxJobRepository;
use orchestrator::store::Store;
use orchestrator::supervisor::LifecycleSupervisor;

async fn test_server() -> TestServer {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn)
        .await
        .expect("connect sqlite memory db");
    schema::migrate(&pool).await.expect("run schema migration");

    let config = Arc::new(AppConfig {
        store_url: String::new(),
        bind_addr: "127.0.0.1:0".to_string(),
        max_batch_size: 4,
        max_batch_wait_ms: 50,
        urgent_threshold: 9,
        lease_ms: 30_000,
        agent_liveness_window_ms: 60_000,
        sweep_interval_ms: 500,
        max_backlog: 1_000,
        max_timeout_ms: 3_600_000,
        dedup_window_ms: 600_000,
        retry_base_delay_ms: 1_000,
        retry_max_delay_ms: 30_000,
        shutdown_grace_ms: 1_000,
    });
    let counters = Counters::default();
    let repo = Arc::new(SqlxJobRepository::new(pool));
    let store = Arc::new(Store::new(repo, config.dedup_window_ms));

    let state = AppState {
        intake: Arc::new(Intake::new(store.clone(), config.clone(), counters.clone())),
        registry: Arc::new(AgentRegistry::new(store.clone(), config.clone(), counters.clone())),
        supervisor: Arc::new(LifecycleSupervisor::new(store.clone(), config.clone(), counters.clone())),
        store,
        config,
        counters,
    };

    TestServer::new(api::router(state)).expect("build test server")
}

fn submit_body() -> serde_json::Value {
    json!({
        "org_id": "acme",
        "app_version_id": "v1",
        "test_path": "tests/login.spec",
        "target": "emulator",
        "priority": 5,
        "timeout_ms": 60_000,
        "retry_budget": 1,
    })
}

/// Submitting a well-formed job returns 201 with a PENDING job id that is
/// then fetchable through the read endpoint.
#[tokio::test]
async fn submit_then_get_round_trips_through_http() {
    let server = test_server().await;

    let response = server.post("/jobs").json(&submit_body()).await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let outcome: orchestrator::intake::SubmitOutcome = response.json();
    assert_eq!(outcome.state, orchestrator::model::job::JobState::Pending);

    let fetched = server.get(&format!("/jobs/{}", outcome.job_id)).await;
    fetched.assert_status_ok();
}

/// A payload failing validation comes back as 400 with the field errors,
/// not a generic 500.
#[tokio::test]
async fn submit_with_invalid_payload_returns_400() {
    let server = test_server().await;

    let mut body = submit_body();
    body["priority"] = json!(99);
    body["org_id"] = json!("");

    let response = server.post("/jobs").json(&body).await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

/// Cancelling a job through the HTTP surface moves it to CANCELLED, and a
/// second cancel on the now-terminal job is rejected as a conflict.
#[tokio::test]
async fn cancel_then_recancel_returns_conflict() {
    let server = test_server().await;

    let submitted = server.post("/jobs").json(&submit_body()).await;
    let outcome: orchestrator::intake::SubmitOutcome = submitted.json();

    let cancel = server
        .post(&format!("/jobs/{}/cancel", outcome.job_id))
        .json(&json!({"reason": "operator requested"}))
        .await;
    cancel.assert_status_ok();

    let fetched: orchestrator::model::job::Job = server.get(&format!("/jobs/{}", outcome.job_id)).await.json();
    assert_eq!(fetched.state, orchestrator::model::job::JobState::Cancelled);

    let second_cancel = server
        .post(&format!("/jobs/{}/cancel", outcome.job_id))
        .json(&json!({"reason": "again"}))
        .await;
    second_cancel.assert_status(axum::http::StatusCode::CONFLICT);
}

/// Fetching a job that was never submitted is a 404, not a 500 or an
/// empty 200.
#[tokio::test]
async fn get_unknown_job_returns_404() {
    let server = test_server().await;
    let response = server.get(&format!("/jobs/{}", Uuid::new_v4())).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}
