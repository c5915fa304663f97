//! Deploy and diff commands.

use anyhow::Result;
use serde_json::Value;

use super::ApiClient;

const COLLECTIONS: [&str; 5] = ["domains", "ports", "volumes", "sysctls", "ulimits"];

pub async fn deploy(client: &ApiClient, project: &str) -> Result<()> {
    let response: Value = client
        .post(&format!("/api/v1/projects/{}/deploy", project))
        .await?
        .json()
        .await?;

    println!(
        "Deploy {} started",
        response["project_deployment_id"].as_str().unwrap_or("?")
    );
    for deployment in response["deployments"].as_array().into_iter().flatten() {
        println!(
            "  deployment {}  service {}",
            deployment["id"].as_str().unwrap_or("?"),
            deployment["service_id"].as_str().unwrap_or("?"),
        );
    }
    println!("Follow a build with: dockyard logs build <deployment>");
    Ok(())
}

pub async fn diff(client: &ApiClient, project: &str) -> Result<()> {
    let diffs: Vec<Value> = client
        .get(&format!("/api/v1/projects/{}/diff", project))
        .await?
        .json()
        .await?;

    if diffs.is_empty() {
        println!("No pending changes");
        return Ok(());
    }
    for entry in &diffs {
        for line in describe(entry) {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Human-readable summary of one service's pending changes.
fn describe(entry: &Value) -> Vec<String> {
    let name = entry["service"]["name"].as_str().unwrap_or("?");
    let build = if entry["requires_build"].as_bool().unwrap_or(false) {
        "build"
    } else {
        "no build"
    };
    let mut lines = vec![format!("{} ({})", name, build)];

    for change in entry["diff"]["fields"].as_array().into_iter().flatten() {
        lines.push(format!(
            "  ~ {}: {} -> {}",
            change["field"].as_str().unwrap_or("?"),
            change["old"],
            change["new"]
        ));
    }
    for collection in COLLECTIONS {
        let delta = &entry["diff"][collection];
        let count = |key: &str| delta[key].as_array().map_or(0, Vec::len);
        let (added, removed, changed) = (count("added"), count("removed"), count("changed"));
        if added + removed + changed > 0 {
            lines.push(format!(
                "  {}: +{} -{} ~{}",
                collection, added, removed, changed
            ));
        }
    }
    lines
}
