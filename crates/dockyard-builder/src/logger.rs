//! Append-only structured build log.
//!
//! Each record is one JSON object per line (`{"t":..,"l":..,"m":..}`). Lines
//! are flushed as they are written so readers tailing the file see output
//! while the build is still running.

use async_trait::async_trait;
use dockyard_core::builder::LogSink;
use dockyard_core::log::{LogLevel, LogLine};
use dockyard_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct BuildLogger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl BuildLogger {
    /// Create (or truncate) the log file at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Multi-line messages become one record per line.
    pub async fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let mut buf = Vec::new();
        for line in message.lines() {
            let record = LogLine::new(level, line.trim_end_matches('\r'));
            serde_json::to_writer(&mut buf, &record)
                .map_err(|e| Error::Internal(format!("encoding log line: {}", e)))?;
            buf.push(b'\n');
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("build log already closed".to_string()))?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    /// Flush and release the file handle. Later writes fail.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for BuildLogger {
    async fn write(&self, level: LogLevel, message: &str) -> Result<()> {
        self.log(level, message).await
    }
}
