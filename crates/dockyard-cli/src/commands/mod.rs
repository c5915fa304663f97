//! CLI commands.

pub mod deploy;
pub mod logs;

use anyhow::{Context, Result, bail};
use dockyard_config::parse_system_config;
use std::path::Path;
use tracing::debug;

/// Thin wrapper over the HTTP API.
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Send `request`, turning non-2xx responses into errors carrying the
    /// server's `error` message.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.context("API request failed")?;
        let status = response.status();
        debug!(status = %status, url = %response.url(), "API response");
        if status.is_success() {
            return Ok(response);
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        match body.get("error").and_then(|e| e.as_str()) {
            Some(message) => bail!("{} ({})", message, status),
            None => bail!("request failed with {}", status),
        }
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.send(self.http.get(self.url(path))).await
    }

    pub async fn post(&self, path: &str) -> Result<reqwest::Response> {
        self.send(self.http.post(self.url(path))).await
    }
}

/// Parse a system configuration without contacting the server.
pub fn validate(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = parse_system_config(&text)?;
    config.validate()?;

    println!("✓ {} is valid", path.display());
    println!("  listen:          {}", config.server.listen);
    println!("  max builds:      {}", config.builds.max_concurrent);
    println!(
        "  registry:        {}",
        config.builds.registry.as_deref().unwrap_or("(none, images stay local)")
    );
    println!("  network:         {}", config.orchestrator.network);
    Ok(())
}
