//! SQLite-backed record of every key the fetcher has attempted.
//!
//! A row for a key means "do not look this up again", whether or not the
//! lookup produced metadata. Only the fetcher writes here; the merge never
//! reads it.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::{LookupStatus, MetadataRecord, ProgressEntry};
use crate::normalize::TrackKey;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS progress (
        key        TEXT PRIMARY KEY,
        metadata   TEXT,
        status     TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )";

/// Per-status entry counts.
#[derive(Default, Debug, Clone, serde::Serialize)]
pub struct ProgressCounts {
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl ProgressCounts {
    pub fn total(&self) -> usize {
        self.found + self.not_found + self.failed
    }
}

pub struct ProgressStore {
    conn: Connection,
}

impl ProgressStore {
    /// Open (creating if needed) the store at `path`. Schema creation is
    /// idempotent, and concurrent openers wait on the lock instead of failing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open progress store {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on progress store")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(SCHEMA, [])
            .context("Failed to create progress table")?;

        let store = Self { conn };
        let counts = store.counts()?;
        info!(
            "Progress store ready: {} entries ({} found, {} not found, {} failed)",
            counts.total(),
            counts.found,
            counts.not_found,
            counts.failed
        );
        Ok(store)
    }

    /// Every key with a progress entry, including those recorded without
    /// metadata.
    pub fn load_all_keys(&self) -> Result<FxHashSet<TrackKey>> {
        let mut stmt = self.conn.prepare("SELECT key FROM progress")?;
        let mut rows = stmt.query([])?;
        let mut keys = FxHashSet::default();
        while let Some(row) = rows.next()? {
            keys.insert(TrackKey::from_stored(row.get(0)?));
        }
        Ok(keys)
    }

    /// Upsert a batch in one transaction: all entries commit or none do.
    /// Re-running the same batch overwrites instead of failing.
    pub fn upsert_batch(&mut self, entries: &[ProgressEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO progress (key, metadata, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    metadata = excluded.metadata,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
            )?;

            for entry in entries {
                let metadata_json = entry
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    entry.key.as_str(),
                    metadata_json,
                    entry.status.as_str(),
                    entry.updated_at,
                ])?;
            }
        }
        tx.commit().context("Failed to commit progress batch")?;
        Ok(entries.len())
    }

    pub fn get(&self, key: &TrackKey) -> Result<Option<ProgressEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, metadata, status, updated_at FROM progress WHERE key = ?1",
                params![key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, metadata_json, status, updated_at)) = row else {
            return Ok(None);
        };

        let metadata = match metadata_json {
            Some(json) => Some(
                serde_json::from_str::<MetadataRecord>(&json)
                    .with_context(|| format!("Corrupt metadata for key {}", key))?,
            ),
            None => None,
        };
        let status = LookupStatus::parse(&status)
            .with_context(|| format!("Unknown status '{}' for key {}", status, key))?;

        Ok(Some(ProgressEntry {
            key: TrackKey::from_stored(key),
            status,
            metadata,
            updated_at,
        }))
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM progress", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn counts(&self) -> Result<ProgressCounts> {
        let mut counts = ProgressCounts::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM progress GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match LookupStatus::parse(&status) {
                Some(LookupStatus::Found) => counts.found = count as usize,
                Some(LookupStatus::NotFound) => counts.not_found = count as usize,
                Some(LookupStatus::Failed) => counts.failed = count as usize,
                None => warn!("Ignoring {} progress rows with unknown status '{}'", count, status),
            }
        }
        Ok(counts)
    }

    /// Remove specific keys so the next fetch attempts them again.
    pub fn forget(&mut self, keys: &[TrackKey]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM progress WHERE key = ?1")?;
            for key in keys {
                removed += stmt.execute(params![key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Remove every entry recorded without metadata (not found or failed).
    pub fn forget_unresolved(&mut self) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM progress WHERE metadata IS NULL", [])?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_key;
    use tempfile::TempDir;

    fn entry(track: &str, artist: &str, metadata: Option<MetadataRecord>) -> ProgressEntry {
        let status = if metadata.is_some() {
            LookupStatus::Found
        } else {
            LookupStatus::NotFound
        };
        ProgressEntry {
            key: normalize_key(Some(track), Some(artist)),
            status,
            metadata,
            updated_at: 1_700_000_000,
        }
    }

    fn found(id: &str) -> Option<MetadataRecord> {
        Some(MetadataRecord {
            spotify_id: Some(id.to_string()),
            track_popularity: Some(42),
            ..Default::default()
        })
    }

    #[test]
    fn test_upsert_same_key_twice_keeps_one_row() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::open(dir.path().join("progress.sqlite")).unwrap();

        store.upsert_batch(&[entry("Song", "Artist", None)]).unwrap();
        store.upsert_batch(&[entry("song", "ARTIST", found("id1"))]).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        let stored = store
            .get(&normalize_key(Some("Song"), Some("Artist")))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LookupStatus::Found);
        assert_eq!(stored.metadata.unwrap().spotify_id.as_deref(), Some("id1"));
    }

    #[test]
    fn test_rerunning_a_batch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::open(dir.path().join("progress.sqlite")).unwrap();
        let batch = vec![entry("A", "X", found("a")), entry("B", "Y", None)];

        assert_eq!(store.upsert_batch(&batch).unwrap(), 2);
        assert_eq!(store.upsert_batch(&batch).unwrap(), 2);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_failed_batch_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::open(dir.path().join("progress.sqlite")).unwrap();
        store.upsert_batch(&[entry("Z", "W", found("z"))]).unwrap();

        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_b BEFORE INSERT ON progress
                 WHEN NEW.key LIKE 'b%'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let batch = vec![entry("A", "X", found("a")), entry("B", "Y", None), entry("C", "Z", None)];
        assert!(store.upsert_batch(&batch).is_err());

        // The entry written before the failing one was rolled back too
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get(&normalize_key(Some("A"), Some("X"))).unwrap().is_none());
        assert!(store.get(&normalize_key(Some("Z"), Some("W"))).unwrap().is_some());
    }

    #[test]
    fn test_load_all_keys_includes_null_metadata() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::open(dir.path().join("progress.sqlite")).unwrap();
        store
            .upsert_batch(&[entry("A", "X", found("a")), entry("B", "Y", None)])
            .unwrap();

        let keys = store.load_all_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&normalize_key(Some("B"), Some("Y"))));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("progress.sqlite");
        {
            let mut store = ProgressStore::open(&path).unwrap();
            store.upsert_batch(&[entry("A", "X", found("a"))]).unwrap();
        }
        let store = ProgressStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        // Opening twice in a row must not fail on schema creation
        let again = ProgressStore::open(&path).unwrap();
        assert_eq!(again.counts().unwrap().found, 1);
    }

    #[test]
    fn test_forget_unresolved() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::open(dir.path().join("progress.sqlite")).unwrap();
        store
            .upsert_batch(&[
                entry("A", "X", found("a")),
                entry("B", "Y", None),
                entry("C", "Z", None),
            ])
            .unwrap();

        assert_eq!(store.forget_unresolved().unwrap(), 2);
        assert_eq!(store.len().unwrap(), 1);

        let removed = store
            .forget(&[normalize_key(Some("A"), Some("X")), normalize_key(Some("Q"), Some("Q"))])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty().unwrap());
    }
}
