//! Keys already enriched by an external dataset.
//!
//! The dataset is streamed record by record and only its track, artist and
//! signal columns are inspected. A row counts as enriched when the strong
//! signal column (a vendor track identifier) is non-empty. The weak signal
//! (a popularity score) is consulted only when the strong column does not
//! exist in the file at all: a joined-but-unmatched row still carries the
//! weak column in many exports, so treating it as proof of enrichment would
//! exclude nearly everything.

use anyhow::{Context, Result};
use csv::{ByteRecord, ReaderBuilder, StringRecord};
use rustc_hash::FxHashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::base_table::{decode_headers, field};
use crate::error::{malformed_csv, require_input, PipelineError};
use crate::models::{DEFAULT_ARTIST_COLUMN, DEFAULT_TRACK_COLUMN};
use crate::normalize::{normalize_key, TrackKey};
use crate::progress::{create_spinner, log_progress};

/// Records accounted per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

#[derive(Clone, Debug)]
pub struct SkipSetConfig {
    pub track_column: String,
    pub artist_column: String,
    pub strong_signal: String,
    pub weak_signal: String,
    pub chunk_size: usize,
}

impl Default for SkipSetConfig {
    fn default() -> Self {
        Self {
            track_column: DEFAULT_TRACK_COLUMN.to_string(),
            artist_column: DEFAULT_ARTIST_COLUMN.to_string(),
            strong_signal: "track_id".to_string(),
            weak_signal: "popularity".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Which column decided "already enriched".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipSignal {
    Strong(String),
    Weak(String),
    /// Neither signal column exists; nothing is skipped
    Unavailable,
    /// No external dataset configured
    NotConfigured,
}

#[derive(Debug)]
pub struct SkipSet {
    pub keys: FxHashSet<TrackKey>,
    pub signal: SkipSignal,
    pub rows_scanned: usize,
}

impl SkipSet {
    pub fn empty() -> Self {
        Self {
            keys: FxHashSet::default(),
            signal: SkipSignal::NotConfigured,
            rows_scanned: 0,
        }
    }

    pub fn contains(&self, key: &TrackKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Pick the signal column from the header. Strong wins whenever it exists.
pub fn resolve_signal(headers: &StringRecord, config: &SkipSetConfig) -> (SkipSignal, Option<usize>) {
    if let Some(idx) = column_index(headers, &config.strong_signal) {
        return (SkipSignal::Strong(config.strong_signal.clone()), Some(idx));
    }
    if let Some(idx) = column_index(headers, &config.weak_signal) {
        return (SkipSignal::Weak(config.weak_signal.clone()), Some(idx));
    }
    (SkipSignal::Unavailable, None)
}

/// Scan `external` and collect the keys it already enriched.
pub fn build_skip_set(external: &Path, config: &SkipSetConfig) -> Result<SkipSet> {
    require_input(external)?;

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(external)
        .with_context(|| format!("Failed to open external dataset {}", external.display()))?;
    let headers = decode_headers(reader.byte_headers().map_err(|e| malformed_csv(external, e))?);

    let track_idx = column_index(&headers, &config.track_column).ok_or_else(|| {
        PipelineError::MissingColumn {
            path: external.to_path_buf(),
            column: config.track_column.clone(),
        }
    })?;
    let artist_idx = column_index(&headers, &config.artist_column).ok_or_else(|| {
        PipelineError::MissingColumn {
            path: external.to_path_buf(),
            column: config.artist_column.clone(),
        }
    })?;

    let (signal, signal_idx) = resolve_signal(&headers, config);
    match &signal {
        SkipSignal::Strong(col) => info!("Skip signal: strong column '{}'", col),
        SkipSignal::Weak(col) => warn!(
            "Strong signal '{}' absent from {}; falling back to weak column '{}'",
            config.strong_signal,
            external.display(),
            col
        ),
        _ => warn!(
            "Neither '{}' nor '{}' present in {}; no keys will be skipped",
            config.strong_signal,
            config.weak_signal,
            external.display()
        ),
    }
    let Some(signal_idx) = signal_idx else {
        return Ok(SkipSet {
            keys: FxHashSet::default(),
            signal,
            rows_scanned: 0,
        });
    };

    let spinner = create_spinner("Building skip set");
    let chunk_size = config.chunk_size.max(1);
    let mut keys = FxHashSet::default();
    let mut record = ByteRecord::new();
    let mut rows = 0usize;

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(external, e))?
    {
        rows += 1;
        let enriched = record
            .get(signal_idx)
            .is_some_and(|v| v.iter().any(|b| !b.is_ascii_whitespace()));
        if enriched {
            let key = normalize_key(
                field(&record, track_idx).as_deref(),
                field(&record, artist_idx).as_deref(),
            );
            if key.is_complete() {
                keys.insert(key);
            }
        }
        if rows % chunk_size == 0 {
            spinner.set_message(format!("Building skip set: {} rows", rows));
            log_progress("skip-set", rows as u64, 0, chunk_size as u64);
        }
    }

    spinner.finish_with_message(format!("Skip set: {} keys from {} rows", keys.len(), rows));
    info!("Loaded {} externally enriched keys from {} rows", keys.len(), rows);

    Ok(SkipSet {
        keys,
        signal,
        rows_scanned: rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn key(t: &str, a: &str) -> TrackKey {
        normalize_key(Some(t), Some(a))
    }

    #[test]
    fn test_strong_signal_required_when_present() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "ext.csv",
            "master_metadata_track_name,master_metadata_album_artist_name,track_id,popularity\n\
             Song A,Artist X,4uLU6h,55\n\
             Song B,Artist Y,,70\n",
        );

        let set = build_skip_set(&path, &SkipSetConfig::default()).unwrap();
        assert_eq!(set.signal, SkipSignal::Strong("track_id".to_string()));
        assert!(set.contains(&key("song a", "artist x")));
        // Weak signal alone does not count while the strong column exists
        assert!(!set.contains(&key("Song B", "Artist Y")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.rows_scanned, 2);
    }

    #[test]
    fn test_weak_signal_used_only_without_strong_column() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "ext.csv",
            "master_metadata_track_name,master_metadata_album_artist_name,popularity\n\
             Song A,Artist X,55\n\
             Song B,Artist Y,\n",
        );

        let set = build_skip_set(&path, &SkipSetConfig::default()).unwrap();
        assert_eq!(set.signal, SkipSignal::Weak("popularity".to_string()));
        assert!(set.contains(&key("Song A", "Artist X")));
        assert!(!set.contains(&key("Song B", "Artist Y")));
    }

    #[test]
    fn test_configured_signal_columns() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "ext.csv",
            "track,artist,vendor_id,popularity\n\
             Song A,Artist X,,90\n\
             Song B,Artist Y,v-2,\n",
        );
        let config = SkipSetConfig {
            track_column: "track".to_string(),
            artist_column: "artist".to_string(),
            strong_signal: "vendor_id".to_string(),
            chunk_size: 1,
            ..Default::default()
        };

        let set = build_skip_set(&path, &config).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&key("Song B", "Artist Y")));
    }

    #[test]
    fn test_no_signal_column_skips_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "ext.csv",
            "master_metadata_track_name,master_metadata_album_artist_name,genre\n\
             Song A,Artist X,rock\n",
        );
        let set = build_skip_set(&path, &SkipSetConfig::default()).unwrap();
        assert_eq!(set.signal, SkipSignal::Unavailable);
        assert!(set.is_empty());
    }

    #[test]
    fn test_non_utf8_rows_still_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ext.csv");
        std::fs::write(
            &path,
            b"master_metadata_track_name,master_metadata_album_artist_name,track_id\n\
              Caf\xE9,Artist Y,abc\n"
                .as_slice(),
        )
        .unwrap();

        let set = build_skip_set(&path, &SkipSetConfig::default()).unwrap();
        assert!(set.contains(&key("Caf\u{FFFD}", "Artist Y")));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = build_skip_set(&dir.path().join("nope.csv"), &SkipSetConfig::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_missing_name_column_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "ext.csv", "name,track_id\nSong,abc\n");
        let err = build_skip_set(&path, &SkipSetConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingColumn { .. })
        ));
    }
}
