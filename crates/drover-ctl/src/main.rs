//! drover-ctl — command-line interface for the Drover daemon.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

mod cmd;

use cmd::{base_url, get_json, post_json_body};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    peer_id: String,
    version: String,
    is_started: bool,
    cycle: u64,
    require_access_codes: bool,
    public_key: String,
    connected_peers: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRow {
    task_id: String,
    title: String,
    result: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let port: u16 = std::env::var("DROVER_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8889);

    match args.first().map(String::as_str) {
        Some("status") | None => status(port).await,
        Some("task") => {
            let path = args.get(1).context("usage: drover-ctl task <file.json>")?;
            post_task(port, path).await
        }
        Some("tasks") => {
            let template_id = args.get(1).context("usage: drover-ctl tasks <templateId>")?;
            list_tasks(port, template_id).await
        }
        Some(other) => bail!("unknown command: {other} (try status | task | tasks)"),
    }
}

async fn status(port: u16) -> Result<()> {
    let url = format!("{}/", base_url(port));
    let resp: StatusResponse = get_json(&url).await?;

    println!("═══════════════════════════════════════");
    println!("  Drover Manager Status");
    println!("═══════════════════════════════════════");
    println!("  Peer id          : {}…", &resp.peer_id[..16.min(resp.peer_id.len())]);
    println!("  Version          : {}", resp.version);
    println!("  Started          : {}", resp.is_started);
    println!("  Cycle            : {}", resp.cycle);
    println!("  Access codes     : {}", resp.require_access_codes);
    println!("  Public key       : {}…", &resp.public_key[..16.min(resp.public_key.len())]);
    println!("  Connected workers: {}", resp.connected_peers.len());

    for peer in &resp.connected_peers {
        println!("    - {}", peer);
    }
    Ok(())
}

async fn post_task(port: u16, path: &str) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?,
    )
    .with_context(|| format!("{path} is not valid JSON"))?;

    let url = format!("{}/task", base_url(port));
    let resp: serde_json::Value = post_json_body(&url, &body).await?;
    println!("accepted: {resp}");
    Ok(())
}

async fn list_tasks(port: u16, template_id: &str) -> Result<()> {
    let url = format!("{}/tasks/{}", base_url(port), template_id);
    let rows: Vec<TaskRow> = get_json(&url).await?;

    if rows.is_empty() {
        println!("no tasks for template {template_id}");
        return Ok(());
    }
    for row in rows {
        let result = row
            .result
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {}  {}  {}", row.task_id, row.title, result);
    }
    Ok(())
}
