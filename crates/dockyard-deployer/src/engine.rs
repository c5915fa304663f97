//! Minimal engine API client for service logs.
//!
//! The engine exposes aggregated service logs at `/services/{id}/logs`,
//! which the typed client does not cover. Requests are plain HTTP/1.0 over
//! the local socket so the body arrives unchunked and ends when the engine
//! closes the connection.

use dockyard_core::orchestrator::{LogOptions, RawLogStream};
use dockyard_core::{Error, Result};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Upper bound on an error body read back from the engine.
const MAX_ERROR_BODY: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct EngineClient {
    socket: PathBuf,
}

impl EngineClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Request target for a service's logs.
    pub fn service_logs_path(service: &str, options: &LogOptions) -> String {
        let mut path = format!(
            "/services/{}/logs?stdout=1&stderr=1&timestamps=1&follow={}",
            service,
            u8::from(options.follow)
        );
        match options.tail {
            Some(tail) => path.push_str(&format!("&tail={}", tail)),
            None => path.push_str("&tail=all"),
        }
        if let Some(since) = options.since {
            path.push_str(&format!("&since={}", since.timestamp()));
        }
        path
    }

    /// Open the multiplexed log stream of every task of `service`.
    pub async fn service_logs(&self, service: &str, options: &LogOptions) -> Result<RawLogStream> {
        let path = Self::service_logs_path(service, options);
        debug!(socket = %self.socket.display(), path = %path, "Requesting service logs");

        let mut stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::Orchestrator(format!(
                "cannot connect to {}: {}",
                self.socket.display(),
                e
            ))
        })?;
        let request = format!("GET {} HTTP/1.0\r\nHost: docker\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let status = read_head(&mut reader).await?;
        if status != 200 {
            let mut body = String::new();
            (&mut reader)
                .take(MAX_ERROR_BODY)
                .read_to_string(&mut body)
                .await?;
            return Err(Error::Orchestrator(format!(
                "service logs for {} returned {}: {}",
                service,
                status,
                error_message(&body)
            )));
        }

        Ok(ReaderStream::new(reader).boxed())
    }
}

/// Consume the status line and headers, returning the status code.
async fn read_head<R>(reader: &mut R) -> Result<u16>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            Error::Orchestrator(format!("malformed engine response: {}", line.trim()))
        })?;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(status)
}

/// Error body the engine sends with a non-2xx status.
#[derive(Debug, Deserialize)]
struct EngineError {
    message: String,
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<EngineError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string())
}
