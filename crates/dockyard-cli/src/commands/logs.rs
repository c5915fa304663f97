//! Log streaming commands.
//!
//! The server sends log lines as server-sent events whose `data` field is
//! one `{t, l, m}` record.

use anyhow::Result;
use dockyard_core::log::{LogLevel, LogLine};
use futures::StreamExt;

use super::ApiClient;

pub async fn build(client: &ApiClient, deployment: &str) -> Result<()> {
    follow(client, &format!("/api/v1/deployments/{}/logs", deployment)).await
}

pub async fn service(client: &ApiClient, service: &str, tail: Option<u64>) -> Result<()> {
    let mut path = format!("/api/v1/services/{}/logs", service);
    if let Some(tail) = tail {
        path.push_str(&format!("?tail={}", tail));
    }
    follow(client, &path).await
}

async fn follow(client: &ApiClient, path: &str) -> Result<()> {
    let response = client.get(path).await?;
    let mut body = response.bytes_stream();
    let mut decoder = EventDecoder::default();

    loop {
        tokio::select! {
            chunk = body.next() => {
                let Some(chunk) = chunk else {
                    break;
                };
                for data in decoder.push(&chunk?) {
                    print_line(&data);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_line(data: &str) {
    match serde_json::from_str::<LogLine>(data) {
        Ok(line) => {
            let stamp = line.timestamp.format("%H:%M:%S%.3f");
            match line.level {
                LogLevel::Stderr => eprintln!("{} {}", stamp, line.message),
                LogLevel::Stdout => println!("{} {}", stamp, line.message),
                LogLevel::Notice => println!("{} ==> {}", stamp, line.message),
            }
        }
        Err(_) => println!("{}", data),
    }
}

/// Incremental server-sent events parser yielding each event's data.
#[derive(Default)]
struct EventDecoder {
    buffer: String,
    data: Vec<String>,
}

impl EventDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Comments (keep-alives) and other fields are ignored.
        }
        events
    }
}
