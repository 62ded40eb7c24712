//! Enrichment coverage of a merged output.
//!
//! Streams the enriched table once and counts rows and unique keys that
//! carry a primary identifier. When an external skip set is supplied, the
//! overlap and combined coverage of both sources is reported as well.

use anyhow::{Context, Result};
use csv::{ByteRecord, ReaderBuilder, StringRecord};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::path::Path;

use crate::base_table::{decode_headers, field, name_columns};
use crate::error::{malformed_csv, require_input, PipelineError};
use crate::models::Columns;
use crate::normalize::{normalize_key, TrackKey};
use crate::progress::log_progress;
use crate::progress_store::ProgressCounts;
use crate::skip_set::SkipSet;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExternalCoverage {
    pub keys: usize,
    /// Keys enriched by both sources
    pub overlap: usize,
    pub combined_keys: usize,
    pub combined_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageReport {
    pub total_rows: usize,
    pub enriched_rows: usize,
    pub row_pct: f64,
    pub unique_keys: usize,
    pub enriched_keys: usize,
    pub key_pct: f64,
    /// Unique keys enriched by no source
    pub remaining_keys: usize,
    pub external: Option<ExternalCoverage>,
    pub progress: Option<ProgressCounts>,
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

/// The enriched identifier column: `spotify_id_api` when the base table
/// already had a `spotify_id`, otherwise `spotify_id`.
fn id_column(path: &Path, headers: &StringRecord) -> Result<usize> {
    ["spotify_id_api", "spotify_id"]
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
        .ok_or_else(|| {
            PipelineError::MissingColumn {
                path: path.to_path_buf(),
                column: "spotify_id".to_string(),
            }
            .into()
        })
}

/// Build the coverage report for `enriched`.
pub fn analyze_coverage(enriched: &Path, columns: &Columns, external: Option<&SkipSet>) -> Result<CoverageReport> {
    require_input(enriched)?;
    let mut reader = ReaderBuilder::new()
        .from_path(enriched)
        .with_context(|| format!("Failed to open {}", enriched.display()))?;
    let headers = decode_headers(reader.byte_headers().map_err(|e| malformed_csv(enriched, e))?);
    let (track_idx, artist_idx) = name_columns(enriched, &headers, columns)?;
    let id_idx = id_column(enriched, &headers)?;

    let mut all_keys: FxHashSet<TrackKey> = FxHashSet::default();
    let mut enriched_keys: FxHashSet<TrackKey> = FxHashSet::default();
    let mut report = CoverageReport::default();
    let mut record = ByteRecord::new();

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(enriched, e))?
    {
        report.total_rows += 1;
        log_progress("coverage", report.total_rows as u64, 0, 100_000);

        let has_id = record
            .get(id_idx)
            .is_some_and(|v| v.iter().any(|b| !b.is_ascii_whitespace()));
        if has_id {
            report.enriched_rows += 1;
        }
        let key = normalize_key(
            field(&record, track_idx).as_deref(),
            field(&record, artist_idx).as_deref(),
        );
        if !key.is_complete() {
            continue;
        }
        if has_id {
            enriched_keys.insert(key.clone());
        }
        all_keys.insert(key);
    }

    report.unique_keys = all_keys.len();
    report.enriched_keys = enriched_keys.len();
    report.row_pct = pct(report.enriched_rows, report.total_rows);
    report.key_pct = pct(report.enriched_keys, report.unique_keys);

    let mut covered = report.enriched_keys;
    if let Some(skip) = external {
        let external_keys: FxHashSet<&TrackKey> = all_keys.iter().filter(|k| skip.contains(k)).collect();
        let overlap = external_keys.iter().filter(|k| enriched_keys.contains(**k)).count();
        let combined = enriched_keys.len() + external_keys.len() - overlap;
        covered = combined;
        report.external = Some(ExternalCoverage {
            keys: external_keys.len(),
            overlap,
            combined_keys: combined,
            combined_pct: pct(combined, report.unique_keys),
        });
    }
    report.remaining_keys = report.unique_keys - covered;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn enriched_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("enriched.csv");
        std::fs::write(
            &path,
            "master_metadata_track_name,master_metadata_album_artist_name,spotify_id\n\
             Song A,Artist X,a1\n\
             song a,artist x,a1\n\
             Song B,Artist Y,\n\
             Song C,Artist Z,\n\
             ,Artist Z,\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_counts_rows_and_keys() {
        let dir = TempDir::new().unwrap();
        let report = analyze_coverage(&enriched_file(&dir), &Columns::default(), None).unwrap();
        assert_eq!(report.total_rows, 5);
        assert_eq!(report.enriched_rows, 2);
        assert_eq!(report.unique_keys, 3);
        assert_eq!(report.enriched_keys, 1);
        assert_eq!(report.remaining_keys, 2);
        assert!((report.row_pct - 40.0).abs() < 1e-9);
        assert!(report.external.is_none());
    }

    #[test]
    fn test_combined_with_external_source() {
        let dir = TempDir::new().unwrap();
        let mut skip = SkipSet::empty();
        skip.keys.insert(normalize_key(Some("Song A"), Some("Artist X")));
        skip.keys.insert(normalize_key(Some("Song B"), Some("Artist Y")));
        // Not in the history at all
        skip.keys.insert(normalize_key(Some("Song Q"), Some("Artist Q")));

        let report = analyze_coverage(&enriched_file(&dir), &Columns::default(), Some(&skip)).unwrap();
        let external = report.external.unwrap();
        assert_eq!(external.keys, 2);
        assert_eq!(external.overlap, 1);
        assert_eq!(external.combined_keys, 2);
        assert_eq!(report.remaining_keys, 1);
    }

    #[test]
    fn test_requires_identifier_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.csv");
        std::fs::write(
            &path,
            "master_metadata_track_name,master_metadata_album_artist_name\nSong A,Artist X\n",
        )
        .unwrap();
        let err = analyze_coverage(&path, &Columns::default(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingColumn { .. })
        ));
    }
}
