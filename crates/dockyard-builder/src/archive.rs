//! Brotli archives of finished build logs.
//!
//! Compression streams the log file through the compressor on a blocking
//! thread, so peak memory is bounded by the compressed output rather than
//! the raw log.

use brotli::{CompressorWriter, Decompressor};
use dockyard_core::log::LogLine;
use dockyard_core::{Error, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const BUFFER_SIZE: usize = 4096;
const QUALITY: u32 = 11;
const WINDOW: u32 = 22;

/// Compress the NDJSON log at `path`.
pub async fn compress_log_file(path: &Path) -> Result<Vec<u8>> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut input = std::fs::File::open(&path)?;
        let mut compressed = Vec::new();
        {
            let mut compressor =
                CompressorWriter::new(&mut compressed, BUFFER_SIZE, QUALITY, WINDOW);
            std::io::copy(&mut input, &mut compressor)?;
            compressor.flush()?;
        }
        Ok(compressed)
    })
    .await
    .map_err(|e| Error::Internal(format!("log compression task failed: {}", e)))?
}

/// Compress in-memory log lines. Used when a deployment fails before a log
/// file exists.
pub fn compress_lines(lines: &[LogLine]) -> Result<Vec<u8>> {
    let mut compressed = Vec::new();
    {
        let mut compressor = CompressorWriter::new(&mut compressed, BUFFER_SIZE, QUALITY, WINDOW);
        for line in lines {
            serde_json::to_writer(&mut compressor, line)
                .map_err(|e| Error::Internal(format!("encoding log line: {}", e)))?;
            compressor.write_all(b"\n")?;
        }
        compressor.flush()?;
    }
    Ok(compressed)
}

/// Decompress an archive into its log lines. Malformed lines are skipped.
pub fn decompress_logs(archive: &[u8]) -> Result<Vec<LogLine>> {
    let reader = BufReader::new(Decompressor::new(archive, BUFFER_SIZE));
    let mut lines = Vec::new();
    for line in reader.lines() {
        if let Some(parsed) = LogLine::from_json_line(&line?) {
            lines.push(parsed);
        }
    }
    Ok(lines)
}
