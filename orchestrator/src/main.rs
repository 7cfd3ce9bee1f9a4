use std::sync::Arc;
use std::time::Duration;

use orchestrator::api::{self, AppState};
use orchestrator::batcher::Batcher;
use orchestrator::config::AppConfig;
use orchestrator::db::Db;
use orchestrator::intake::Intake;
use orchestrator::logger::init_tracing;
use orchestrator::metrics::Counters;
use orchestrator::registry::AgentRegistry;
use orchestrator::scheduler::Scheduler;
use orchestrator::store::repository_sqlx::SqlxJobRepository;
use orchestrator::store::Store;
use orchestrator::supervisor::LifecycleSupervisor;

/// Connects, migrates, rebuilds the in-memory queue index from durable
/// state, and unwinds any ASSIGNED/RUNNING work left behind by a crash.
/// Must run before the Scheduler's first tick.
async fn init_store(cfg: &AppConfig) -> anyhow::Result<Arc<Store>> {
    let db = Db::connect(&cfg.store_url).await?;
    db.migrate().await?;

    let repo = Arc::new(SqlxJobRepository::new((*db.pool).clone()));
    let store = Arc::new(Store::new(repo, cfg.dedup_window_ms));

    store.rebuild_queue_index().await?;

    Ok(store)
}

/// Runs `tick_fn` on a fixed cadence until the process exits, logging
/// (rather than aborting on) individual tick failures.
fn spawn_ticker<F, Fut>(label: &'static str, interval: Duration, mut tick_fn: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = tick_fn().await {
                tracing::error!(error=?e, label, "tick failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting job orchestrator...");

    let cfg = Arc::new(AppConfig::from_env());

    let store = init_store(&cfg).await?;
    let counters = Counters::default();

    let supervisor = Arc::new(LifecycleSupervisor::new(
        store.clone(),
        cfg.clone(),
        counters.clone(),
    ));

    let recovered = supervisor.recover().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "reclaimed stuck assignments on startup");
    }

    let intake = Arc::new(Intake::new(store.clone(), cfg.clone(), counters.clone()));
    let registry = Arc::new(AgentRegistry::new(store.clone(), cfg.clone(), counters.clone()));
    let batcher = Arc::new(Batcher::new(store.clone(), cfg.clone(), counters.clone()));
    let scheduler = Arc::new(Scheduler::new(store.clone(), cfg.clone(), counters.clone()));

    {
        let batcher = batcher.clone();
        spawn_ticker(
            "batcher",
            Duration::from_millis(cfg.max_batch_wait_ms.min(1_000)),
            move || {
                let batcher = batcher.clone();
                async move {
                    batcher.tick().await?;
                    Ok(())
                }
            },
        );
    }

    {
        let scheduler = scheduler.clone();
        spawn_ticker("scheduler", Duration::from_millis(250), move || {
            let scheduler = scheduler.clone();
            async move {
                scheduler.tick().await?;
                Ok(())
            }
        });
    }

    {
        let supervisor = supervisor.clone();
        spawn_ticker(
            "supervisor_sweep",
            Duration::from_millis(cfg.sweep_interval_ms),
            move || {
                let supervisor = supervisor.clone();
                async move { supervisor.sweep().await }
            },
        );
    }

    {
        let registry = registry.clone();
        spawn_ticker(
            "agent_liveness_sweep",
            Duration::from_millis(cfg.agent_liveness_window_ms.min(10_000)),
            move || {
                let registry = registry.clone();
                async move {
                    registry.sweep_liveness().await?;
                    Ok(())
                }
            },
        );
    }

    let state = AppState {
        store: store.clone(),
        config: cfg.clone(),
        intake,
        registry,
        supervisor,
        counters,
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;

    tracing::info!(bind_addr = %cfg.bind_addr, "orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cfg.shutdown_grace_ms))
        .await?;

    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal(grace_ms: u64) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=?e, "failed to install ctrl_c handler");
        return;
    }
    tracing::info!(grace_ms, "shutdown signal received, draining");
    tokio::time::sleep(Duration::from_millis(grace_ms)).await;
}
