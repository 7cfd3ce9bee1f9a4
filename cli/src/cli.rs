use clap::{Parser, Subcommand};

/// Thin HTTP front-end for the job orchestrator.
///
/// This binary never talks to the store, the scheduler, or agents
/// directly; every subcommand issues exactly one HTTP request against
/// the orchestrator's API surface and prints the response.
#[derive(Debug, Parser)]
#[clap(name = "qgctl", version)]
pub struct Cli {
    /// Base URL of the orchestrator API, e.g. http://localhost:8080
    #[clap(long, env = "ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a new job.
    Submit {
        #[clap(long)]
        org_id: String,
        #[clap(long)]
        app_version_id: String,
        #[clap(long)]
        test_path: String,
        #[clap(long, default_value = "emulator")]
        target: String,
        #[clap(long, default_value_t = 5)]
        priority: i32,
        #[clap(long, default_value_t = 60_000)]
        timeout_ms: u64,
        #[clap(long, default_value_t = 0)]
        retry_budget: i32,
        #[clap(long)]
        client_request_id: Option<String>,
    },
    /// Fetch a single job by id.
    Get { job_id: String },
    /// List jobs with optional filters.
    List {
        #[clap(long)]
        org_id: Option<String>,
        #[clap(long)]
        status: Option<String>,
    },
    /// Cancel a job.
    Cancel {
        job_id: String,
        #[clap(long, default_value = "requested by operator")]
        reason: String,
    },
    /// Fetch orchestrator metrics.
    Metrics,
}
