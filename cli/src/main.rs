pub mod cli;

use clap::Parser;
use cli::{Cli, Command};
use serde_json::{Value, json};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let (method, path, body): (reqwest::Method, String, Option<Value>) = match &cli.command {
        Command::Submit {
            org_id,
            app_version_id,
            test_path,
            target,
            priority,
            timeout_ms,
            retry_budget,
            client_request_id,
        } => (
            reqwest::Method::POST,
            "/jobs".to_string(),
            Some(json!({
                "org_id": org_id,
                "app_version_id": app_version_id,
                "test_path": test_path,
                "target": target,
                "priority": priority,
                "timeout_ms": timeout_ms,
                "retry_budget": retry_budget,
                "client_request_id": client_request_id,
            })),
        ),
        Command::Get { job_id } => (reqwest::Method::GET, format!("/jobs/{job_id}"), None),
        Command::List { org_id, status } => {
            let mut path = "/jobs?".to_string();
            if let Some(o) = org_id {
                path.push_str(&format!("org_id={o}&"));
            }
            if let Some(s) = status {
                path.push_str(&format!("status={s}&"));
            }
            (reqwest::Method::GET, path, None)
        }
        Command::Cancel { job_id, reason } => (
            reqwest::Method::POST,
            format!("/jobs/{job_id}/cancel"),
            Some(json!({ "reason": reason })),
        ),
        Command::Metrics => (reqwest::Method::GET, "/metrics".to_string(), None),
    };

    let url = format!("{}{}", cli.url.trim_end_matches('/'), path);
    let mut req = client.request(method, &url);
    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = req.send().await?;
    let status = resp.status();
    let text = resp.text().await?;

    println!("{status}");
    match serde_json::from_str::<Value>(&text) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        Err(_) => println!("{text}"),
    }

    Ok(())
}
