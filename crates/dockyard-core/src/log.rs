//! Structured build/runtime log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Stdout,
    Stderr,
    /// Messages emitted by dockyard itself (pipeline milestones, errors).
    Notice,
}

/// One line of output. Serializes to the compact `{t, l, m}` shape used in
/// log files, archives and streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "l")]
    pub level: LogLevel,
    #[serde(rename = "m")]
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Notice, message)
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Stderr, message)
    }

    /// Parse one NDJSON line; blank or malformed lines yield `None`.
    pub fn from_json_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}
