//! Core data models for the enrichment pipeline.
//!
//! This module contains the metadata record written by lookups, the lookup
//! outcome the fetcher dispatches on, progress entries, and the per-stage
//! statistics structs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::normalize::TrackKey;

// ============================================================================
// Column Layout
// ============================================================================

/// Default base-table column holding the raw track name
pub const DEFAULT_TRACK_COLUMN: &str = "master_metadata_track_name";

/// Default base-table column holding the raw artist name
pub const DEFAULT_ARTIST_COLUMN: &str = "master_metadata_album_artist_name";

/// Attribute columns of a MetadataRecord, in log and output order.
/// `spotify_id` is the primary identifier used by merge dedup.
pub const METADATA_COLUMNS: &[&str] = &[
    "spotify_id",
    "spotify_uri",
    "track_popularity",
    "track_duration_ms",
    "track_explicit",
    "track_preview_url",
    "album_name",
    "album_release_date",
    "album_release_date_precision",
    "album_total_tracks",
    "album_type",
    "artist_popularity",
    "artist_followers",
    "api_genres",
    "enrichment_source",
];

/// Column names used to read track/artist out of a CSV table.
#[derive(Clone, Debug)]
pub struct Columns {
    pub track: String,
    pub artist: String,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            track: DEFAULT_TRACK_COLUMN.to_string(),
            artist: DEFAULT_ARTIST_COLUMN.to_string(),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Result of one successful external lookup. Every attribute is nullable
/// on its own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub spotify_id: Option<String>,
    pub spotify_uri: Option<String>,
    pub track_popularity: Option<i64>,
    pub track_duration_ms: Option<i64>,
    pub track_explicit: Option<bool>,
    pub track_preview_url: Option<String>,
    pub album_name: Option<String>,
    pub album_release_date: Option<String>,
    pub album_release_date_precision: Option<String>,
    pub album_total_tracks: Option<i64>,
    pub album_type: Option<String>,
    pub artist_popularity: Option<i64>,
    pub artist_followers: Option<i64>,
    pub api_genres: Option<String>,
    pub enrichment_source: Option<String>,
}

fn text<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

impl MetadataRecord {
    /// Attribute values as CSV fields, aligned with `METADATA_COLUMNS`.
    /// Null attributes become empty fields.
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            text(&self.spotify_id),
            text(&self.spotify_uri),
            text(&self.track_popularity),
            text(&self.track_duration_ms),
            text(&self.track_explicit),
            text(&self.track_preview_url),
            text(&self.album_name),
            text(&self.album_release_date),
            text(&self.album_release_date_precision),
            text(&self.album_total_tracks),
            text(&self.album_type),
            text(&self.artist_popularity),
            text(&self.artist_followers),
            text(&self.api_genres),
            text(&self.enrichment_source),
        ]
    }

    /// True when the primary identifier is populated.
    pub fn has_primary_id(&self) -> bool {
        self.spotify_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

// ============================================================================
// Lookup Outcome
// ============================================================================

/// What one lookup attempt produced. The fetcher dispatches on this
/// instead of inspecting error messages.
#[derive(Clone, Debug, PartialEq)]
pub enum LookupOutcome {
    Found(MetadataRecord),
    /// Definitive: the service has no match for this pair
    NotFound,
    /// Rate limit, network or server trouble. Worth retrying.
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Authentication failure. Waiting will not fix it.
    Fatal(String),
}

/// Terminal status recorded for an attempted key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Found,
    NotFound,
    /// Transient failures exhausted the retry budget
    Failed,
}

impl LookupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupStatus::Found => "found",
            LookupStatus::NotFound => "not_found",
            LookupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "found" => Some(LookupStatus::Found),
            "not_found" => Some(LookupStatus::NotFound),
            "failed" => Some(LookupStatus::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Work Items and Results
// ============================================================================

/// A key still needing lookup, with the first-seen raw names used to query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTrack {
    pub key: TrackKey,
    pub track: String,
    pub artist: String,
}

/// One finished lookup: what gets appended to the log and upserted into the
/// progress store.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResult {
    pub track: PendingTrack,
    pub status: LookupStatus,
    pub metadata: Option<MetadataRecord>,
    /// Unix seconds
    pub fetched_at: i64,
}

/// Persisted progress row: `metadata == None` still means "attempted".
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEntry {
    pub key: TrackKey,
    pub status: LookupStatus,
    pub metadata: Option<MetadataRecord>,
    pub updated_at: i64,
}

impl From<&FetchResult> for ProgressEntry {
    fn from(result: &FetchResult) -> Self {
        ProgressEntry {
            key: result.track.key.clone(),
            status: result.status,
            metadata: result.metadata.clone(),
            updated_at: result.fetched_at,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one fetch run.
#[derive(Default, Debug, Clone, Serialize)]
pub struct FetchStats {
    // Work computation
    pub unique_keys: usize,
    pub incomplete_rows: usize,
    pub skipped_external: usize,
    pub skipped_processed: usize,
    pub pending: usize,

    // Lookups
    pub attempted: usize,
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
    pub retries: usize,

    // Persistence
    pub batches: usize,
    pub log_rows_written: usize,
    pub progress_rows_written: usize,

    pub elapsed_seconds: f64,
}

impl FetchStats {
    pub fn record(&mut self, status: LookupStatus) {
        self.attempted += 1;
        match status {
            LookupStatus::Found => self.found += 1,
            LookupStatus::NotFound => self.not_found += 1,
            LookupStatus::Failed => self.failed += 1,
        }
    }

    /// Found lookups as a percentage of attempted
    pub fn hit_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            100.0 * self.found as f64 / self.attempted as f64
        }
    }
}

/// Row counts reported by the merge as a sanity check.
#[derive(Default, Debug, Clone, Serialize)]
pub struct MergeStats {
    pub base_rows: usize,
    pub metadata_rows: usize,
    pub metadata_keys: usize,
    pub duplicates_dropped: usize,
    pub matched_rows: usize,
    /// Log rows skipped because their width did not match the header
    pub torn_log_rows: usize,
    // External pre-enriched dataset, when merged in
    pub external_rows: usize,
    pub external_keys: usize,
    pub external_matched_rows: usize,
    pub output_rows: usize,
    pub elapsed_seconds: f64,
}

/// Write any serializable stats struct as pretty JSON.
pub fn write_stats_json<T: Serialize>(stats: &T, path: &std::path::Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(stats)?;
    std::fs::write(path, json)?;
    Ok(())
}
