//! Streams the base play table and works out which keys still need lookup.
//!
//! pending = unique complete base keys - skip set - progress store keys,
//! in first-seen order. Only unique keys are held in memory, never rows.
//!
//! Tables are read as raw bytes and decoded lossily: a stray Latin-1 byte
//! becomes U+FFFD instead of aborting the stage. The base table is read
//! strictly (every row as wide as the header) here and at merge time.

use anyhow::{Context, Result};
use csv::{ByteRecord, Reader, ReaderBuilder, StringRecord};
use std::borrow::Cow;
use std::fs::File;
use rustc_hash::FxHashSet;
use std::path::Path;
use tracing::info;

use crate::error::{malformed_csv, require_input, PipelineError};
use crate::models::{Columns, FetchStats, PendingTrack};
use crate::normalize::{normalize_key, TrackKey};
use crate::progress::log_progress;
use crate::skip_set::SkipSet;

/// Result of the scan: the ordered work queue plus the counters behind it.
#[derive(Debug, Default)]
pub struct PendingWork {
    pub pending: Vec<PendingTrack>,
    pub unique_keys: usize,
    pub incomplete_rows: usize,
    pub skipped_external: usize,
    pub skipped_processed: usize,
}

impl PendingWork {
    /// Copy the work counters into run stats.
    pub fn fill_stats(&self, stats: &mut FetchStats) {
        stats.unique_keys = self.unique_keys;
        stats.incomplete_rows = self.incomplete_rows;
        stats.skipped_external = self.skipped_external;
        stats.skipped_processed = self.skipped_processed;
        stats.pending = self.pending.len();
    }
}

/// Header row decoded lossily, so non-UTF-8 names still resolve.
pub fn decode_headers(headers: &ByteRecord) -> StringRecord {
    headers.iter().map(String::from_utf8_lossy).collect()
}

/// Field `idx` decoded lossily.
pub fn field(record: &ByteRecord, idx: usize) -> Option<Cow<'_, str>> {
    record.get(idx).map(String::from_utf8_lossy)
}

/// Open the base table with the reader settings every stage shares.
pub fn open_base(base: &Path) -> Result<(Reader<File>, StringRecord)> {
    let mut reader = ReaderBuilder::new()
        .flexible(false)
        .from_path(base)
        .with_context(|| format!("Failed to open base table {}", base.display()))?;
    let headers = decode_headers(reader.byte_headers().map_err(|e| malformed_csv(base, e))?);
    Ok((reader, headers))
}

/// Resolve the (track, artist) column indices of `path`'s header.
pub fn name_columns(path: &Path, headers: &StringRecord, columns: &Columns) -> Result<(usize, usize)> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| PipelineError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    Ok((find(&columns.track)?, find(&columns.artist)?))
}

/// Scan the base table and partition its unique keys.
pub fn scan_pending(
    base: &Path,
    columns: &Columns,
    skip: &SkipSet,
    processed: &FxHashSet<TrackKey>,
) -> Result<PendingWork> {
    require_input(base)?;

    let (mut reader, headers) = open_base(base)?;
    let (track_idx, artist_idx) = name_columns(base, &headers, columns)?;

    let mut seen: FxHashSet<TrackKey> = FxHashSet::default();
    let mut work = PendingWork::default();
    let mut record = ByteRecord::new();
    let mut rows = 0u64;

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(base, e))?
    {
        rows += 1;
        log_progress("base-scan", rows, 0, 100_000);

        let track = field(&record, track_idx);
        let artist = field(&record, artist_idx);
        let key = normalize_key(track.as_deref(), artist.as_deref());
        if !key.is_complete() {
            work.incomplete_rows += 1;
            continue;
        }
        if !seen.insert(key.clone()) {
            continue;
        }

        if skip.contains(&key) {
            work.skipped_external += 1;
        } else if processed.contains(&key) {
            work.skipped_processed += 1;
        } else {
            work.pending.push(PendingTrack {
                key,
                track: track.as_deref().unwrap_or_default().trim().to_string(),
                artist: artist.as_deref().unwrap_or_default().trim().to_string(),
            });
        }
    }

    work.unique_keys = seen.len();
    info!(
        "Base scan: {} rows, {} unique keys, {} without track/artist",
        rows, work.unique_keys, work.incomplete_rows
    );
    info!(
        "After skip filters: to_process={} (skipped external={}, already processed={})",
        work.pending.len(),
        work.skipped_external,
        work.skipped_processed
    );
    Ok(work)
}
