//! Demultiplexer for engine log streams.
//!
//! Each frame is an 8-byte header (stream type in byte 0, big-endian
//! payload length in bytes 4..8) followed by the payload. With timestamps
//! requested the payload starts with an RFC 3339 time and a space.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use dockyard_core::log::{LogLevel, LogLine};
use dockyard_core::orchestrator::RawLogStream;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use tracing::warn;

const HEADER_LEN: usize = 8;
const STDERR_STREAM: u8 = 2;

/// Incremental frame decoder. Bytes that do not yet form a whole frame are
/// held until the rest arrives.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    buffer: BytesMut,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let stream = self.buffer[0];
            let len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(len);
            let level = if stream == STDERR_STREAM {
                LogLevel::Stderr
            } else {
                LogLevel::Stdout
            };
            lines.extend(parse_payload(level, &payload));
        }
        lines
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Split a payload into records. A payload normally holds one line but the
/// engine may batch several.
fn parse_payload(level: LogLevel, payload: &[u8]) -> Vec<LogLine> {
    String::from_utf8_lossy(payload)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| parse_line(level, line))
        .collect()
}

fn parse_line(level: LogLevel, line: &str) -> LogLine {
    let line = line.trim_end_matches('\r');
    if let Some((token, message)) = line.split_once(' ') {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(token) {
            return LogLine {
                timestamp: timestamp.with_timezone(&Utc),
                level,
                message: message.to_string(),
            };
        }
    }
    LogLine::new(level, line)
}

/// Decode a raw engine stream into records. A transport error ends the
/// stream with one synthetic `stderr` line describing it.
pub fn demux_stream(raw: RawLogStream) -> BoxStream<'static, LogLine> {
    struct State {
        raw: Option<RawLogStream>,
        demuxer: LogDemuxer,
        ready: VecDeque<LogLine>,
    }

    let state = State {
        raw: Some(raw),
        demuxer: LogDemuxer::new(),
        ready: VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((line, state));
            }
            let raw = state.raw.as_mut()?;
            match raw.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.demuxer.push(&chunk)),
                Some(Err(e)) => {
                    warn!(error = %e, "Runtime log stream failed");
                    state.raw = None;
                    state
                        .ready
                        .push_back(LogLine::stderr(format!("log stream failed: {}", e)));
                }
                None => {
                    if state.demuxer.pending() > 0 {
                        warn!(
                            bytes = state.demuxer.pending(),
                            "Runtime log stream ended inside a frame"
                        );
                    }
                    state.raw = None;
                }
            }
        }
    })
    .boxed()
}
