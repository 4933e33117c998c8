//! Storage layer: the resumable result store, one SQLite file per sweep.
//!
//! Entries are keyed by [`Configuration::key`] and kept in insertion order.
//! The controller never overwrites an entry (it checks `contains` first),
//! but `put` itself is an unconditional upsert.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Result, SweepError};
use crate::models::{Configuration, MeasurementOutcome, StoredResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS results (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    configuration TEXT NOT NULL,
    outcome TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
";

const UPSERT: &str = "
INSERT INTO results (key, configuration, outcome, recorded_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(key) DO UPDATE SET
    configuration = excluded.configuration,
    outcome = excluded.outcome,
    recorded_at = excluded.recorded_at
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store file used when a sweep configuration names none.
pub const DEFAULT_STORE_FILE: &str = "sweep-results.db";

/// Handle on a persisted result store.
///
/// Owned by a single writer for the duration of a sweep. `close` consumes
/// the handle; dropping it without closing is only expected on abnormal exit.
#[derive(Debug)]
pub struct ResultStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ResultStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |source| SweepError::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        };
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;

        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        debug!(path = %path.display(), entries = store.size()?, "Result store opened");
        Ok(store)
    }

    /// A throwaway store that lives only as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    /// File backing the store; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether `configuration` already has an entry, whatever its outcome.
    pub fn contains(&self, configuration: &Configuration) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM results WHERE key = ?1",
                [configuration.key()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Stored outcome for `configuration`, looked up by its canonical key.
    pub fn get(&self, configuration: &Configuration) -> Result<Option<MeasurementOutcome>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT outcome FROM results WHERE key = ?1",
                [configuration.key()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(SweepError::from))
            .transpose()
    }

    /// Insert or overwrite the outcome for `configuration`.
    pub fn put(&self, configuration: &Configuration, outcome: &MeasurementOutcome) -> Result<()> {
        upsert(&self.conn, configuration, outcome, Utc::now())
    }

    /// Number of stored entries.
    pub fn size(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Result<Vec<StoredResult>> {
        let mut stmt = self
            .conn
            .prepare("SELECT configuration, outcome, recorded_at FROM results ORDER BY seq")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(configuration, outcome, recorded_at)| -> Result<StoredResult> {
                Ok(StoredResult {
                    configuration: serde_json::from_str(&configuration)?,
                    outcome: serde_json::from_str(&outcome)?,
                    recorded_at: recorded_at.parse::<DateTime<Utc>>()?,
                })
            })
            .collect()
    }

    /// Remove every entry. Only call this while no sweep is using the store.
    pub fn clear(&self) -> Result<u64> {
        let removed = self.conn.execute("DELETE FROM results", [])?;
        info!(removed, "Result store cleared");
        Ok(removed as u64)
    }

    /// Copy every entry into the store at `target`, leaving this one untouched.
    ///
    /// Entries already present in the target are overwritten; others are kept.
    /// Returns the number of entries copied.
    pub fn export(&self, target: impl AsRef<Path>) -> Result<u64> {
        let target = target.as_ref();
        if let Some(source) = &self.path {
            if same_file(source, target) {
                return Err(SweepError::Config(format!(
                    "export target {} is the source store",
                    target.display()
                )));
            }
        }

        let entries = self.entries()?;
        let mut destination = ResultStore::open(target)?;
        let tx = destination.conn.transaction()?;
        for entry in &entries {
            upsert(&tx, &entry.configuration, &entry.outcome, entry.recorded_at)?;
        }
        tx.commit()?;
        destination.close()?;

        info!(
            target = %target.display(),
            entries = entries.len(),
            "Exported results"
        );
        Ok(entries.len() as u64)
    }

    /// Release the underlying connection.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| SweepError::Storage(e))
    }
}

fn upsert(
    conn: &Connection,
    configuration: &Configuration,
    outcome: &MeasurementOutcome,
    recorded_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        UPSERT,
        params![
            configuration.key(),
            serde_json::to_string(configuration)?,
            serde_json::to_string(outcome)?,
            recorded_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;
    use tempfile::TempDir;

    fn cfg(a: &str) -> Configuration {
        Configuration::from_pairs([("--a", a), ("--b", "x")])
    }

    fn success(v: f64) -> MeasurementOutcome {
        MeasurementOutcome::from_samples(vec![Sample::new(v, "k")])
    }

    #[test]
    fn test_put_get_contains() {
        let store = ResultStore::open_in_memory().unwrap();
        assert!(!store.contains(&cfg("1")).unwrap());
        store.put(&cfg("1"), &success(3.0)).unwrap();
        assert!(store.contains(&cfg("1")).unwrap());
        assert_eq!(store.get(&cfg("1")).unwrap(), Some(success(3.0)));
        assert_eq!(store.get(&cfg("2")).unwrap(), None);
        assert_eq!(store.size().unwrap(), 1);
    }

    #[test]
    fn test_lookup_ignores_pair_order() {
        let store = ResultStore::open_in_memory().unwrap();
        store.put(&cfg("1"), &success(3.0)).unwrap();
        let reordered = Configuration::from_pairs([("--b", "x"), ("--a", "1")]);
        assert!(store.contains(&reordered).unwrap());
    }

    #[test]
    fn test_put_overwrites_and_keeps_position() {
        let store = ResultStore::open_in_memory().unwrap();
        store.put(&cfg("1"), &success(1.0)).unwrap();
        store.put(&cfg("2"), &success(2.0)).unwrap();
        store.put(&cfg("1"), &success(9.0)).unwrap();
        assert_eq!(store.size().unwrap(), 2);
        let entries = store.entries().unwrap();
        assert_eq!(entries[0].configuration, cfg("1"));
        assert_eq!(entries[0].outcome, success(9.0));
        assert_eq!(entries[1].configuration, cfg("2"));
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.sqlite");
        for i in 0..5 {
            let store = ResultStore::open(&path).unwrap();
            assert_eq!(store.size().unwrap(), i);
            store.put(&cfg(&i.to_string()), &success(i as f64)).unwrap();
            store.close().unwrap();
        }
        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.size().unwrap(), 5);
        assert_eq!(store.get(&cfg("4")).unwrap(), Some(success(4.0)));
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("does").join("not").join("exist.sqlite");
        let err = ResultStore::open(&path).unwrap_err();
        assert!(matches!(err, SweepError::StorageUnavailable { .. }));
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = ResultStore::open_in_memory().unwrap();
        store.put(&cfg("1"), &success(1.0)).unwrap();
        store.put(&cfg("2"), &success(2.0)).unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_export_merges_and_leaves_source_untouched() {
        let tmp = TempDir::new().unwrap();
        let source_path = tmp.path().join("work.sqlite");
        let target_path = tmp.path().join("saved.sqlite");

        let target = ResultStore::open(&target_path).unwrap();
        target.put(&cfg("1"), &success(100.0)).unwrap();
        target.put(&cfg("9"), &success(9.0)).unwrap();
        target.close().unwrap();

        let source = ResultStore::open(&source_path).unwrap();
        source.put(&cfg("1"), &success(1.0)).unwrap();
        source.put(&cfg("2"), &MeasurementOutcome::failed("early-exit:1")).unwrap();
        assert_eq!(source.export(&target_path).unwrap(), 2);
        assert_eq!(source.size().unwrap(), 2);

        let target = ResultStore::open(&target_path).unwrap();
        assert_eq!(target.size().unwrap(), 3);
        assert_eq!(target.get(&cfg("1")).unwrap(), Some(success(1.0)));
        assert_eq!(target.get(&cfg("9")).unwrap(), Some(success(9.0)));
        assert!(!target.get(&cfg("2")).unwrap().unwrap().is_success());
    }

    #[test]
    fn test_export_to_self_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("work.sqlite");
        let store = ResultStore::open(&path).unwrap();
        assert!(matches!(store.export(&path), Err(SweepError::Config(_))));
    }
}
