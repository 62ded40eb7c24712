//! Append-only CSV log of fetch results.
//!
//! The header is written once, when the file is created. Every batch is
//! appended, flushed and synced to disk before the progress store records
//! the same keys, so a key present in the store always has a log row.
//! Duplicate keys across runs are expected and resolved at merge time.
//!
//! A crash mid-append can leave a torn last row with no trailing newline.
//! `open` cuts the file back to its last complete row before appending.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::PipelineError;
use crate::models::{FetchResult, DEFAULT_ARTIST_COLUMN, DEFAULT_TRACK_COLUMN, METADATA_COLUMNS};

pub const STATUS_COLUMN: &str = "lookup_status";
pub const FETCHED_AT_COLUMN: &str = "fetched_at";
pub const KEY_COLUMN: &str = "key";

/// Bytes read per step while searching backwards for the last newline
const TAIL_SCAN_CHUNK: usize = 64 * 1024;

/// Full log header: names, status, timestamp, attributes, raw key.
pub fn log_header() -> Vec<&'static str> {
    let mut header = vec![
        DEFAULT_TRACK_COLUMN,
        DEFAULT_ARTIST_COLUMN,
        STATUS_COLUMN,
        FETCHED_AT_COLUMN,
    ];
    header.extend_from_slice(METADATA_COLUMNS);
    header.push(KEY_COLUMN);
    header
}

pub struct MetadataLog {
    path: PathBuf,
}

impl MetadataLog {
    /// Open the log, writing the header if the file is new or empty.
    /// An existing file with a different header is rejected.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        if path.exists() {
            Self::repair_tail(&path)?;
        }

        let is_empty = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_empty {
            let mut writer = WriterBuilder::new()
                .from_path(&path)
                .with_context(|| format!("Failed to create metadata log {}", path.display()))?;
            writer.write_record(log_header())?;
            writer.flush()?;
        } else {
            Self::check_header(&path)?;
        }

        Ok(Self { path })
    }

    /// Truncate a trailing partial row. Returns the bytes removed.
    fn repair_tail(path: &Path) -> Result<u64> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open metadata log {}", path.display()))?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(0);
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(0);
        }

        let mut buf = vec![0u8; TAIL_SCAN_CHUNK];
        let mut end = len;
        let keep = loop {
            if end == 0 {
                break 0;
            }
            let start = end.saturating_sub(TAIL_SCAN_CHUNK as u64);
            let chunk = &mut buf[..(end - start) as usize];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(chunk)?;
            if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
                break start + pos as u64 + 1;
            }
            end = start;
        };

        warn!(
            "Metadata log {} ends in a partial row; dropping its last {} bytes",
            path.display(),
            len - keep
        );
        file.set_len(keep)
            .with_context(|| format!("Failed to truncate metadata log {}", path.display()))?;
        file.sync_all()?;
        Ok(len - keep)
    }

    fn check_header(path: &Path) -> Result<()> {
        let mut reader = ReaderBuilder::new()
            .from_path(path)
            .with_context(|| format!("Failed to open metadata log {}", path.display()))?;
        let found: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let expected = log_header();
        if found != expected {
            return Err(PipelineError::MalformedInput {
                path: path.to_path_buf(),
                reason: format!("unexpected header {:?}", found),
            }
            .into());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row per result and sync. Returns rows written.
    pub fn append(&mut self, results: &[FetchResult]) -> Result<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open metadata log {}", self.path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        for result in results {
            let mut row = vec![
                result.track.track.clone(),
                result.track.artist.clone(),
                result.status.as_str().to_string(),
                result.fetched_at.to_string(),
            ];
            match &result.metadata {
                Some(meta) => row.extend(meta.to_fields()),
                None => row.extend(std::iter::repeat(String::new()).take(METADATA_COLUMNS.len())),
            }
            row.push(result.track.key.as_str().to_string());
            writer.write_record(&row)?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush metadata log: {}", e.error()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync metadata log {}", self.path.display()))?;
        Ok(results.len())
    }
}
