//! External process runner that streams output into a build log.

use dockyard_core::builder::LogSink;
use dockyard_core::log::LogLevel;
use dockyard_core::{Error, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Number of trailing output lines kept for error reporting.
pub const TAIL_LINES: usize = 20;

/// Exit status of a finished process plus the tail of its output.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub code: Option<i32>,
    pub tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }

    pub fn describe(&self, program: &str) -> String {
        match self.code {
            Some(code) => format!("{} exited with status {}", program, code),
            None => format!("{} was terminated by a signal", program),
        }
    }
}

/// Replace every occurrence of a secret with `***`.
pub fn redact(line: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
}

/// Run `command` to completion, writing stdout/stderr line by line to `log`.
///
/// A non-zero exit is not an error here; callers decide how to classify it
/// from the returned outcome.
pub async fn run_logged(
    mut command: Command,
    log: &dyn LogSink,
    secrets: &[String],
) -> Result<ProcessOutcome> {
    let program = command.as_std().get_program().to_string_lossy().to_string();
    debug!(program = %program, "Spawning process");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to start {}: {}", program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

    // Output is read as raw bytes: a child that prints invalid UTF-8 must
    // still be drained, or it blocks on a full pipe and never exits.
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    while !(stdout_done && stderr_done) {
        // Partial reads stay in the buffers when the other branch wins.
        let (level, read) = tokio::select! {
            read = stdout_reader.read_until(b'\n', &mut stdout_buf), if !stdout_done => {
                (LogLevel::Stdout, read)
            }
            read = stderr_reader.read_until(b'\n', &mut stderr_buf), if !stderr_done => {
                (LogLevel::Stderr, read)
            }
        };
        let buf = match level {
            LogLevel::Stderr => &mut stderr_buf,
            _ => &mut stdout_buf,
        };

        match read {
            Ok(0) => match level {
                LogLevel::Stderr => stderr_done = true,
                _ => stdout_done = true,
            },
            Ok(_) => {
                let line = redact(&decode_line(buf), secrets);
                buf.clear();
                log.write(level, &line).await?;
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                warn!(program = %program, error = %e, "Error reading process output");
                match level {
                    LogLevel::Stderr => stderr_done = true,
                    _ => stdout_done = true,
                }
            }
        }
    }

    let status = child.wait().await?;
    Ok(ProcessOutcome {
        code: status.code(),
        tail: tail.into(),
    })
}

/// Decode one raw output line, dropping its terminator.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
