//! Streaming merge of the base table with the metadata log.
//!
//! Neither file is held in memory. Both are streamed into a scratch SQLite
//! database in a temp directory beside the output, the log is deduplicated
//! to one row per key there, and the left join is streamed back out in base
//! row order. Output rows go to `<output>.partial`, which replaces the
//! output only once its row count equals the base row count.
//!
//! An external pre-enriched dataset can be joined in the same pass. Its
//! columns sit between the base and the metadata columns.
//!
//! Keys are re-derived with `normalize_key` on every side; the raw key
//! column stored in the log is ignored.

use anyhow::{Context, Result};
use csv::{ByteRecord, ReaderBuilder, StringRecord, WriterBuilder};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::base_table::{decode_headers, field, name_columns, open_base};
use crate::error::{malformed_csv, require_input, PipelineError};
use crate::metadata_log::STATUS_COLUMN;
use crate::models::{Columns, LookupStatus, MergeStats, METADATA_COLUMNS};
use crate::normalize::{normalize_key, TrackKey};
use crate::progress::{create_progress_bar, create_spinner, log_progress};
use crate::safety::{partial_path, validate_output_path};
use crate::skip_set::{resolve_signal, SkipSetConfig};

/// Rows per scratch-database transaction
const WRITE_BATCH_SIZE: usize = 10_000;

/// Suffix applied to metadata columns whose name already exists in the base
const COLLISION_SUFFIX: &str = "_api";

/// Suffix applied to external columns whose name already exists in the base
const EXTERNAL_SUFFIX: &str = "_k";

/// Columns taken from an external dataset when its header has them
pub const EXTERNAL_COLUMNS: &[&str] = &[
    "track_id",
    "popularity",
    "acousticness",
    "danceability",
    "duration_ms",
    "energy",
    "instrumentalness",
    "key",
    "liveness",
    "loudness",
    "mode",
    "speechiness",
    "tempo",
    "time_signature",
    "valence",
    "genre",
];

/// A pre-enriched dataset joined into the output by normalized key.
#[derive(Clone, Debug)]
pub struct ExternalSource {
    pub path: PathBuf,
    /// Name columns and signal columns; a row with the signal filled wins
    /// dedup over one without.
    pub config: SkipSetConfig,
    pub keep: Vec<String>,
}

impl ExternalSource {
    pub fn new(path: impl Into<PathBuf>, config: SkipSetConfig) -> Self {
        Self {
            path: path.into(),
            config,
            keep: EXTERNAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Output header: base columns as-is, then external columns, then metadata
/// columns. External columns colliding with the base get `_k`; metadata
/// columns colliding with either get `_api`.
pub fn output_header(base_headers: &StringRecord, external_columns: &[String]) -> Vec<String> {
    let in_base = |name: &str| base_headers.iter().any(|h| h.trim() == name);
    let mut header: Vec<String> = base_headers.iter().map(|h| h.to_string()).collect();
    for col in external_columns {
        if in_base(col) {
            header.push(format!("{}{}", col, EXTERNAL_SUFFIX));
        } else {
            header.push(col.clone());
        }
    }
    for col in METADATA_COLUMNS {
        if in_base(col) || external_columns.iter().any(|c| c == col) {
            header.push(format!("{}{}", col, COLLISION_SUFFIX));
        } else {
            header.push(col.to_string());
        }
    }
    header
}

fn open_scratch(dir: &Path) -> Result<Connection> {
    let conn = Connection::open(dir.join("merge.sqlite3")).context("Failed to create scratch database")?;
    conn.execute_batch(
        "PRAGMA journal_mode = OFF;
         PRAGMA synchronous = OFF;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(conn)
}

fn flush(conn: &mut Connection, sql: &str, rows: &mut Vec<Vec<Value>>) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for row in rows.iter() {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    rows.clear();
    Ok(())
}

/// `prefix0..prefixN`
fn value_columns(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

/// Create `table(seq, key, preferred, cols..)` and return its insert statement.
fn create_source_table(conn: &Connection, table: &str, cols: &[String]) -> Result<String> {
    let mut defs = vec![
        "seq INTEGER PRIMARY KEY".to_string(),
        "key TEXT NOT NULL".to_string(),
        "preferred INTEGER NOT NULL".to_string(),
    ];
    defs.extend(cols.iter().map(|c| format!("{} TEXT", c)));
    conn.execute_batch(&format!("CREATE TABLE {} ({});", table, defs.join(", ")))?;

    let mut names = vec!["seq".to_string(), "key".to_string(), "preferred".to_string()];
    names.extend(cols.iter().cloned());
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        vec!["?"; names.len()].join(", ")
    ))
}

/// Keep one row per key of `table` in `<table>_dedup`: preferred rows beat
/// the rest, and among equals the last written wins. Returns surviving keys.
fn dedup(conn: &Connection, table: &str, cols: &[String]) -> Result<usize> {
    let dedup_table = format!("{}_dedup", table);
    let mut select = vec!["key".to_string()];
    select.extend(cols.iter().cloned());
    let select = select.join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE {dedup_table} AS
         SELECT {select} FROM (
             SELECT {select},
                    ROW_NUMBER() OVER (PARTITION BY key ORDER BY preferred DESC, seq DESC) AS rn
             FROM {table}
         ) WHERE rn = 1;"
    ))?;
    index_unique(conn, &dedup_table)?;

    let keys: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", dedup_table), [], |r| r.get(0))?;
    Ok(keys as usize)
}

/// Build the unique key index the join relies on. A key that violates it is
/// reported as `DuplicateMergeKey`.
fn index_unique(conn: &Connection, table: &str) -> Result<()> {
    match conn.execute_batch(&format!("CREATE UNIQUE INDEX {table}_key ON {table}(key);")) {
        Ok(()) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            let key: String = conn.query_row(
                &format!("SELECT key FROM {} GROUP BY key HAVING COUNT(*) > 1 LIMIT 1", table),
                [],
                |r| r.get(0),
            )?;
            Err(PipelineError::DuplicateMergeKey {
                key: TrackKey::from_stored(key).display_pair(),
            }
            .into())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to index {}", table)),
    }
}

fn text_or_null(value: Option<std::borrow::Cow<'_, str>>) -> Value {
    match value {
        Some(v) if !v.is_empty() => Value::Text(v.into_owned()),
        _ => Value::Null,
    }
}

// ============================================================================
// Phase 1: Load base table
// ============================================================================

/// Stream the base table into `base(row_id, key, c0..cN)`. Returns the
/// base header and row count.
fn load_base(conn: &mut Connection, base: &Path, columns: &Columns) -> Result<(StringRecord, usize)> {
    let (mut reader, headers) = open_base(base)?;
    let (track_idx, artist_idx) = name_columns(base, &headers, columns)?;

    let field_cols = value_columns("c", headers.len());
    conn.execute_batch(&format!(
        "CREATE TABLE base (row_id INTEGER PRIMARY KEY, key TEXT NOT NULL, {});",
        field_cols
            .iter()
            .map(|c| format!("{} TEXT", c))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    let placeholders = vec!["?"; headers.len() + 2].join(", ");
    let insert = format!(
        "INSERT INTO base (row_id, key, {}) VALUES ({})",
        field_cols.join(", "),
        placeholders
    );

    let spinner = create_spinner("Phase 1: Loading base table");
    let mut record = ByteRecord::new();
    let mut pending: Vec<Vec<Value>> = Vec::with_capacity(WRITE_BATCH_SIZE);
    let mut rows = 0usize;

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(base, e))?
    {
        let key = normalize_key(
            field(&record, track_idx).as_deref(),
            field(&record, artist_idx).as_deref(),
        );
        let mut row = Vec::with_capacity(headers.len() + 2);
        row.push(Value::Integer(rows as i64));
        row.push(Value::Text(key.as_str().to_string()));
        row.extend(
            record
                .iter()
                .map(|f| Value::Text(String::from_utf8_lossy(f).into_owned())),
        );
        pending.push(row);
        rows += 1;

        if pending.len() >= WRITE_BATCH_SIZE {
            flush(conn, &insert, &mut pending)?;
            spinner.set_message(format!("Phase 1: Loading base table ({} rows)", rows));
            log_progress("merge-base", rows as u64, 0, WRITE_BATCH_SIZE as u64);
        }
    }
    flush(conn, &insert, &mut pending)?;
    conn.execute_batch("CREATE INDEX base_key ON base(key);")?;

    spinner.finish_with_message(format!("Phase 1: Loaded {} base rows", rows));
    Ok((headers, rows))
}

// ============================================================================
// Phase 2: Load and deduplicate metadata log
// ============================================================================

/// Rows loaded from the log, and rows skipped as torn.
struct LogLoad {
    loaded: usize,
    torn: usize,
}

/// Stream found rows of the log into `meta`, then keep one row per key in
/// `meta_dedup`: a row carrying `spotify_id` beats one without.
///
/// A row narrower or wider than the header is a write cut short by a crash
/// and is skipped; the next fetch run truncates it for good.
fn load_metadata(conn: &mut Connection, log: &Path) -> Result<LogLoad> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(log)
        .with_context(|| format!("Failed to open metadata log {}", log.display()))?;
    let headers = decode_headers(reader.byte_headers().map_err(|e| malformed_csv(log, e))?);
    let (track_idx, artist_idx) = name_columns(log, &headers, &Columns::default())?;
    let status_idx = headers.iter().position(|h| h.trim() == STATUS_COLUMN);
    let meta_idx: Vec<Option<usize>> = METADATA_COLUMNS
        .iter()
        .map(|col| headers.iter().position(|h| h.trim() == *col))
        .collect();
    let missing: Vec<&str> = METADATA_COLUMNS
        .iter()
        .zip(&meta_idx)
        .filter(|(_, idx)| idx.is_none())
        .map(|(col, _)| *col)
        .collect();
    if !missing.is_empty() {
        warn!("Metadata log lacks columns {:?}; they will be empty", missing);
    }

    let meta_cols = value_columns("m", METADATA_COLUMNS.len());
    let insert = create_source_table(conn, "meta", &meta_cols)?;

    let spinner = create_spinner("Phase 2: Loading metadata log");
    let mut record = ByteRecord::new();
    let mut pending: Vec<Vec<Value>> = Vec::with_capacity(WRITE_BATCH_SIZE);
    let mut seq = 0usize;
    let mut load = LogLoad { loaded: 0, torn: 0 };

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(log, e))?
    {
        seq += 1;
        if record.len() != headers.len() {
            warn!(
                "Skipping torn metadata log row {} ({} of {} fields)",
                seq,
                record.len(),
                headers.len()
            );
            load.torn += 1;
            continue;
        }
        // Not-found and failed rows carry no attributes
        if let Some(idx) = status_idx {
            let status = field(&record, idx).and_then(|s| LookupStatus::parse(s.trim()));
            if status != Some(LookupStatus::Found) {
                continue;
            }
        }
        let key = normalize_key(
            field(&record, track_idx).as_deref(),
            field(&record, artist_idx).as_deref(),
        );
        if !key.is_complete() {
            continue;
        }

        let values: Vec<Value> = meta_idx
            .iter()
            .map(|idx| text_or_null(idx.and_then(|i| field(&record, i))))
            .collect();
        let has_primary_id = matches!(values.first(), Some(Value::Text(_)));

        let mut row = Vec::with_capacity(values.len() + 3);
        row.push(Value::Integer(seq as i64));
        row.push(Value::Text(key.as_str().to_string()));
        row.push(Value::Integer(has_primary_id as i64));
        row.extend(values);
        pending.push(row);
        load.loaded += 1;

        if pending.len() >= WRITE_BATCH_SIZE {
            flush(conn, &insert, &mut pending)?;
            log_progress("merge-metadata", seq as u64, 0, WRITE_BATCH_SIZE as u64);
        }
    }
    flush(conn, &insert, &mut pending)?;

    spinner.set_message("Phase 2: Deduplicating metadata");
    dedup(conn, "meta", &meta_cols)?;

    spinner.finish_with_message(format!("Phase 2: Loaded {} metadata rows", load.loaded));
    Ok(load)
}

// ============================================================================
// Phase 2b: Load and deduplicate the external dataset
// ============================================================================

/// External columns present in the dataset, and rows loaded.
struct ExternalLoad {
    columns: Vec<String>,
    rows: usize,
}

/// Stream the external dataset into `ext`, keeping only `source.keep`
/// columns its header has, then dedup into `ext_dedup`. Returns `None` when
/// none of the kept columns exist.
fn load_external(conn: &mut Connection, source: &ExternalSource) -> Result<Option<ExternalLoad>> {
    let path = source.path.as_path();
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open external dataset {}", path.display()))?;
    let headers = decode_headers(reader.byte_headers().map_err(|e| malformed_csv(path, e))?);
    let name_cols = Columns {
        track: source.config.track_column.clone(),
        artist: source.config.artist_column.clone(),
    };
    let (track_idx, artist_idx) = name_columns(path, &headers, &name_cols)?;

    let kept: Vec<(String, usize)> = source
        .keep
        .iter()
        .filter_map(|col| {
            headers
                .iter()
                .position(|h| h.trim() == col)
                .filter(|&i| i != track_idx && i != artist_idx)
                .map(|i| (col.clone(), i))
        })
        .collect();
    if kept.is_empty() {
        warn!(
            "External dataset {} has none of the columns {:?}; not joined",
            path.display(),
            source.keep
        );
        return Ok(None);
    }
    let (_, signal_idx) = resolve_signal(&headers, &source.config);

    let ext_cols = value_columns("e", kept.len());
    let insert = create_source_table(conn, "ext", &ext_cols)?;

    let spinner = create_spinner("Phase 2b: Loading external dataset");
    let mut record = ByteRecord::new();
    let mut pending: Vec<Vec<Value>> = Vec::with_capacity(WRITE_BATCH_SIZE);
    let mut seq = 0usize;
    let mut rows = 0usize;

    while reader
        .read_byte_record(&mut record)
        .map_err(|e| malformed_csv(path, e))?
    {
        seq += 1;
        let key = normalize_key(
            field(&record, track_idx).as_deref(),
            field(&record, artist_idx).as_deref(),
        );
        if !key.is_complete() {
            continue;
        }
        let preferred = signal_idx
            .and_then(|i| record.get(i))
            .is_some_and(|v| v.iter().any(|b| !b.is_ascii_whitespace()));

        let mut row = Vec::with_capacity(kept.len() + 3);
        row.push(Value::Integer(seq as i64));
        row.push(Value::Text(key.as_str().to_string()));
        row.push(Value::Integer(preferred as i64));
        row.extend(kept.iter().map(|(_, i)| text_or_null(field(&record, *i))));
        pending.push(row);
        rows += 1;

        if pending.len() >= WRITE_BATCH_SIZE {
            flush(conn, &insert, &mut pending)?;
            log_progress("merge-external", seq as u64, 0, WRITE_BATCH_SIZE as u64);
        }
    }
    flush(conn, &insert, &mut pending)?;

    spinner.set_message("Phase 2b: Deduplicating external dataset");
    dedup(conn, "ext", &ext_cols)?;

    spinner.finish_with_message(format!("Phase 2b: Loaded {} external rows", rows));
    Ok(Some(ExternalLoad {
        columns: kept.into_iter().map(|(name, _)| name).collect(),
        rows,
    }))
}

// ============================================================================
// Phase 3: Stream the join
// ============================================================================

struct JoinCounts {
    output_rows: usize,
    matched: usize,
    external_matched: usize,
}

/// Write `base LEFT JOIN ext_dedup LEFT JOIN meta_dedup` to `target`.
fn write_join(
    conn: &Connection,
    headers: &StringRecord,
    external_columns: &[String],
    base_rows: usize,
    target: &Path,
) -> Result<JoinCounts> {
    let with_external = !external_columns.is_empty();
    let mut select: Vec<String> = (0..headers.len()).map(|i| format!("b.c{}", i)).collect();
    select.extend((0..external_columns.len()).map(|i| format!("x.e{}", i)));
    select.extend((0..METADATA_COLUMNS.len()).map(|i| format!("m.m{}", i)));
    let width = select.len();
    select.push("m.key IS NOT NULL".to_string());
    select.push(if with_external {
        "x.key IS NOT NULL".to_string()
    } else {
        "0".to_string()
    });

    let external_join = if with_external {
        "LEFT JOIN ext_dedup x ON x.key = b.key"
    } else {
        ""
    };
    let sql = format!(
        "SELECT {}
         FROM base b
         {}
         LEFT JOIN meta_dedup m ON m.key = b.key
         ORDER BY b.row_id",
        select.join(", "),
        external_join
    );

    let mut writer = WriterBuilder::new()
        .from_path(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    writer.write_record(output_header(headers, external_columns))?;

    let pb = create_progress_bar(base_rows as u64, "Phase 3: Writing output");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut fields: Vec<String> = Vec::with_capacity(width);
    let mut counts = JoinCounts {
        output_rows: 0,
        matched: 0,
        external_matched: 0,
    };

    while let Some(row) = rows.next()? {
        fields.clear();
        for i in 0..width {
            fields.push(row.get::<_, Option<String>>(i)?.unwrap_or_default());
        }
        if row.get::<_, bool>(width)? {
            counts.matched += 1;
        }
        if row.get::<_, bool>(width + 1)? {
            counts.external_matched += 1;
        }
        writer.write_record(&fields)?;
        counts.output_rows += 1;
        pb.inc(1);
        log_progress("merge-write", counts.output_rows as u64, base_rows as u64, 100_000);
    }

    writer.flush()?;
    pb.finish_with_message(format!("Phase 3: Wrote {} rows", counts.output_rows));
    Ok(counts)
}

// ============================================================================
// Entry Point
// ============================================================================

/// Left-join `base` with the deduplicated `metadata_log`, and with
/// `external` when given, into `output`.
pub fn merge(
    base: &Path,
    metadata_log: &Path,
    output: &Path,
    columns: &Columns,
    external: Option<&ExternalSource>,
) -> Result<MergeStats> {
    let start = Instant::now();
    require_input(base)?;
    require_input(metadata_log)?;
    let mut sources = vec![base, metadata_log];
    if let Some(source) = external {
        require_input(&source.path)?;
        sources.push(source.path.as_path());
    }
    validate_output_path(output, &sources)?;

    let out_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix(".merge-scratch-")
        .tempdir_in(out_dir)
        .context("Failed to create scratch directory")?;
    let mut conn = open_scratch(scratch.path())?;

    let (headers, base_rows) = load_base(&mut conn, base, columns)?;
    let log = load_metadata(&mut conn, metadata_log)?;
    let metadata_keys: i64 = conn.query_row("SELECT COUNT(*) FROM meta_dedup", [], |r| r.get(0))?;
    let metadata_keys = metadata_keys as usize;

    let mut stats = MergeStats {
        base_rows,
        metadata_rows: log.loaded,
        metadata_keys,
        duplicates_dropped: log.loaded - metadata_keys,
        torn_log_rows: log.torn,
        ..Default::default()
    };

    let mut external_columns = Vec::new();
    if let Some(source) = external {
        if let Some(ext) = load_external(&mut conn, source)? {
            let keys: i64 = conn.query_row("SELECT COUNT(*) FROM ext_dedup", [], |r| r.get(0))?;
            stats.external_rows = ext.rows;
            stats.external_keys = keys as usize;
            external_columns = ext.columns;
        }
    }

    let partial = partial_path(output);
    let counts = write_join(&conn, &headers, &external_columns, base_rows, &partial)?;
    stats.matched_rows = counts.matched;
    stats.external_matched_rows = counts.external_matched;
    stats.output_rows = counts.output_rows;
    stats.elapsed_seconds = start.elapsed().as_secs_f64();

    if stats.output_rows != base_rows {
        let _ = std::fs::remove_file(&partial);
        return Err(PipelineError::MergeCardinality {
            expected: base_rows,
            actual: stats.output_rows,
        }
        .into());
    }

    std::fs::rename(&partial, output)
        .with_context(|| format!("Failed to move merged output to {}", output.display()))?;

    info!(
        "Merge: {} base rows, {} metadata rows -> {} keys ({} duplicates dropped), {} matched, {} output rows",
        stats.base_rows,
        stats.metadata_rows,
        stats.metadata_keys,
        stats.duplicates_dropped,
        stats.matched_rows,
        stats.output_rows
    );
    if external.is_some() {
        info!(
            "External: {} rows -> {} keys, {} base rows matched",
            stats.external_rows, stats.external_keys, stats.external_matched_rows
        );
    }
    Ok(stats)
}
