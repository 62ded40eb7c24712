//! Split a merged history into songs-only and podcasts-only tables.
//!
//! A row is a podcast play when any episode column is filled. Rows are
//! streamed through unchanged with a `media_type` column appended. Both
//! outputs are written to `.partial` files and renamed once complete.

use anyhow::{bail, Context, Result};
use csv::{ByteRecord, ReaderBuilder, StringRecord, Writer, WriterBuilder};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::base_table::decode_headers;
use crate::error::{malformed_csv, require_input};
use crate::progress::{create_spinner, log_progress};
use crate::safety::{partial_path, validate_output_path};

/// Columns whose non-empty value marks a podcast play. Missing columns count
/// as empty.
pub const EPISODE_COLUMNS: &[&str] = &["spotify_episode_uri", "episode_name", "episode_show_name"];

pub const MEDIA_TYPE_COLUMN: &str = "media_type";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SplitStats {
    pub rows: usize,
    pub songs: usize,
    pub podcasts: usize,
}

/// `<stem>_<suffix>.csv` beside `input`.
pub fn sibling_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{}_{}.csv", stem, suffix))
}

fn episode_indices(headers: &StringRecord) -> Vec<usize> {
    EPISODE_COLUMNS
        .iter()
        .filter_map(|col| headers.iter().position(|h| h.trim() == *col))
        .collect()
}

fn is_podcast(record: &ByteRecord, episode_idx: &[usize]) -> bool {
    episode_idx
        .iter()
        .filter_map(|&i| record.get(i))
        .any(|v| v.iter().any(|b| !b.is_ascii_whitespace()))
}

fn create_writer(path: &Path, header: &ByteRecord) -> Result<Writer<File>> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_byte_record(header)?;
    Ok(writer)
}

/// Stream `input` into `songs` and `podcasts`.
pub fn split_media_types(input: &Path, songs: &Path, podcasts: &Path) -> Result<SplitStats> {
    require_input(input)?;
    validate_output_path(songs, &[input, podcasts])?;
    validate_output_path(podcasts, &[input, songs])?;

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let raw_headers = reader.byte_headers().map_err(|e| malformed_csv(input, e))?.clone();
    let headers = decode_headers(&raw_headers);
    if headers.iter().any(|h| h.trim() == MEDIA_TYPE_COLUMN) {
        bail!("{} already has a '{}' column", input.display(), MEDIA_TYPE_COLUMN);
    }
    let episode_idx = episode_indices(&headers);
    if episode_idx.is_empty() {
        info!("No episode columns in {}; every row is a song", input.display());
    }

    let mut out_header = raw_headers.clone();
    out_header.push_field(MEDIA_TYPE_COLUMN.as_bytes());
    let songs_partial = partial_path(songs);
    let podcasts_partial = partial_path(podcasts);
    let mut songs_writer = create_writer(&songs_partial, &out_header)?;
    let mut podcasts_writer = create_writer(&podcasts_partial, &out_header)?;

    let spinner = create_spinner("Splitting songs and podcasts");
    let mut stats = SplitStats::default();
    let mut record = ByteRecord::new();

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(input, e))?
    {
        stats.rows += 1;
        if is_podcast(&record, &episode_idx) {
            record.push_field(b"podcast");
            podcasts_writer.write_byte_record(&record)?;
            stats.podcasts += 1;
        } else {
            record.push_field(b"song");
            songs_writer.write_byte_record(&record)?;
            stats.songs += 1;
        }
        log_progress("split", stats.rows as u64, 0, 100_000);
    }

    songs_writer.flush()?;
    podcasts_writer.flush()?;
    drop(songs_writer);
    drop(podcasts_writer);

    for (partial, target) in [(&songs_partial, songs), (&podcasts_partial, podcasts)] {
        std::fs::rename(partial, target)
            .with_context(|| format!("Failed to move split output to {}", target.display()))?;
    }

    spinner.finish_with_message(format!(
        "Split {} rows: {} songs, {} podcasts",
        stats.rows, stats.songs, stats.podcasts
    ));
    info!(
        "Split {}: {} songs, {} podcasts",
        input.display(),
        stats.songs,
        stats.podcasts
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = ReaderBuilder::new().from_path(path).unwrap();
        let header = reader.headers().unwrap().iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn test_split_by_episode_columns() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("history_enriched.csv");
        std::fs::write(
            &input,
            "ts,master_metadata_track_name,episode_name,spotify_episode_uri\n\
             t1,Song A,,\n\
             t2,,Episode 1,spotify:episode:1\n\
             t3,Song B,  ,\n\
             t4,,,spotify:episode:2\n",
        )
        .unwrap();
        let songs = sibling_path(&input, "songs");
        let podcasts = sibling_path(&input, "podcasts");

        let stats = split_media_types(&input, &songs, &podcasts).unwrap();
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.songs, 2);
        assert_eq!(stats.podcasts, 2);

        let (header, rows) = read_rows(&songs);
        assert_eq!(header.last().map(String::as_str), Some("media_type"));
        assert_eq!(rows[0][0], "t1");
        assert_eq!(rows[1][0], "t3");
        assert!(rows.iter().all(|r| r[4] == "song"));

        let (_, rows) = read_rows(&podcasts);
        assert_eq!(rows[0][0], "t2");
        assert_eq!(rows[1][0], "t4");
        assert!(rows.iter().all(|r| r[4] == "podcast"));
        assert!(!partial_path(&songs).exists());
    }

    #[test]
    fn test_without_episode_columns_all_songs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("plain.csv");
        std::fs::write(&input, "ts,master_metadata_track_name\nt1,Song A\nt2,Song B\n").unwrap();

        let stats = split_media_types(
            &input,
            &dir.path().join("songs.csv"),
            &dir.path().join("podcasts.csv"),
        )
        .unwrap();
        assert_eq!(stats.songs, 2);
        assert_eq!(stats.podcasts, 0);
        let (header, rows) = read_rows(&dir.path().join("podcasts.csv"));
        assert_eq!(header.len(), 3);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_outputs_cannot_overwrite_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("history.csv");
        std::fs::write(&input, "ts\nt1\n").unwrap();
        let err = split_media_types(&input, &input, &dir.path().join("p.csv")).unwrap_err();
        assert!(err.to_string().contains("Safety check failed"));

        let same = dir.path().join("same.csv");
        assert!(split_media_types(&input, &same, &same).is_err());
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(
            sibling_path(Path::new("/data/history_enriched.csv"), "songs"),
            PathBuf::from("/data/history_enriched_songs.csv")
        );
    }
}
