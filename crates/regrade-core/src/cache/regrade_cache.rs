//! SQLite cache for fetched regrade threads
//!
//! Schema:
//! - regrade_records table: one row per (assignment, thread), bincode blob of
//!   the RequestRecord plus a few searchable columns
//! - cache_metadata table: schema version
//!
//! Every put is a single INSERT OR REPLACE, so a crash mid-run leaves each key
//! either at its old value or its new one. The connection sits behind a mutex;
//! fetch workers share the cache through an `Arc`.
//!
//! Cache Version History:
//! - v1: Initial version
//! - v2: Added score and weight to RequestRecord
//! - v3: score and weight became optional

use crate::error::CoreError;
use crate::models::{AssignmentId, CacheKey, RequestRecord};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Current cache version
///
/// Increment when the serialized shape of `RequestRecord` changes. A mismatch
/// clears the stored records on open.
const CACHE_VERSION: i32 = 3;

/// Database file name inside the cache directory
pub const CACHE_FILE: &str = "regrade-cache.db";

/// SQLite-backed record cache (thread-safe)
pub struct RegradeCache {
    conn: Mutex<Connection>,
    cache_path: PathBuf,
}

impl RegradeCache {
    /// Create or open the cache database in `cache_dir`
    pub fn open(cache_dir: &Path) -> Result<Self, CoreError> {
        let cache_path = cache_dir.join(CACHE_FILE);
        Self::init(cache_dir, &cache_path).map_err(|e| CoreError::CacheInit {
            path: cache_path.clone(),
            message: format!("{:#}", e),
        })
    }

    fn init(cache_dir: &Path, cache_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).with_context(|| {
            format!("Failed to create cache directory: {}", cache_dir.display())
        })?;

        let conn = Connection::open(cache_path)
            .with_context(|| format!("Failed to open cache database: {}", cache_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        // Concurrent openers (two runs at once) wait instead of failing
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_metadata (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS regrade_records (
                assignment TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                student TEXT NOT NULL,
                question_id TEXT NOT NULL,
                outcome TEXT,
                fetched_at TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (assignment, thread_id)
            );

            CREATE INDEX IF NOT EXISTS idx_assignment ON regrade_records(assignment);
            "#,
        )
        .context("Failed to create schema")?;

        let stored_version: Option<i32> = conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cache version")?;

        match stored_version {
            Some(v) if v != CACHE_VERSION => {
                warn!(
                    stored = v,
                    current = CACHE_VERSION,
                    "Cache version mismatch detected, clearing stale records"
                );

                conn.execute("DELETE FROM regrade_records", [])
                    .context("Failed to clear stale cache")?;
                conn.execute(
                    "INSERT OR REPLACE INTO cache_metadata (key, value) VALUES ('version', ?)",
                    params![CACHE_VERSION],
                )
                .context("Failed to update cache version")?;
            }
            None => {
                conn.execute(
                    "INSERT INTO cache_metadata (key, value) VALUES ('version', ?)",
                    params![CACHE_VERSION],
                )
                .context("Failed to initialize cache version")?;
                debug!("Cache version initialized to {}", CACHE_VERSION);
            }
            Some(_) => {}
        }

        debug!(path = %cache_path.display(), "Regrade cache initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            cache_path: cache_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Regrade cache lock poisoned: {}", e))
    }

    /// Cached record for `key`, no network involved
    pub fn get(&self, key: &CacheKey) -> Result<Option<RequestRecord>> {
        let conn = self.lock()?;

        let result: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM regrade_records WHERE assignment = ? AND thread_id = ?",
                params![key.assignment(), key.thread().as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cache")?;

        match result {
            Some(bytes) => {
                let record: RequestRecord =
                    bincode::deserialize(&bytes).context("Failed to deserialize cached record")?;
                debug!(key = %key, "Cache hit");
                Ok(Some(record))
            }
            None => {
                debug!(key = %key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Upsert the record under its own key
    pub fn put(&self, record: &RequestRecord) -> Result<(), CoreError> {
        let key = record.cache_key();
        self.write(&key, record).map_err(|e| CoreError::CacheWrite {
            key: key.to_string(),
            message: format!("{:#}", e),
        })
    }

    fn write(&self, key: &CacheKey, record: &RequestRecord) -> Result<()> {
        let data = bincode::serialize(record).context("Failed to serialize record")?;
        let outcome = record.outcome.map(|o| o.label.to_string());

        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT OR REPLACE INTO regrade_records
                (assignment, thread_id, student, question_id, outcome, fetched_at, data)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            params![
                key.assignment(),
                key.thread().as_str(),
                record.student,
                record.question_id,
                outcome,
                record.fetched_at.to_rfc3339(),
                &data,
            ],
        )
        .context("Failed to insert record")?;

        debug!(key = %key, "Record cached");
        Ok(())
    }

    /// `false` whenever `refresh` is set, otherwise whether a record exists
    pub fn contains_fresh(&self, key: &CacheKey, refresh: bool) -> Result<bool> {
        if refresh {
            return Ok(false);
        }
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM regrade_records WHERE assignment = ? AND thread_id = ?",
                params![key.assignment(), key.thread().as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cache")?;
        Ok(exists.is_some())
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM regrade_records WHERE assignment = ? AND thread_id = ?",
            params![key.assignment(), key.thread().as_str()],
        )
        .context("Failed to delete cache entry")?;

        debug!(key = %key, "Cache entry invalidated");
        Ok(())
    }

    /// All cached records of one assignment
    pub fn assignment_records(&self, assignment: &AssignmentId) -> Result<Vec<RequestRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT data FROM regrade_records WHERE assignment = ? ORDER BY thread_id")
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![assignment.storage_key()], |row| row.get::<_, Vec<u8>>(0))
            .context("Failed to query assignment records")?;

        let mut records = Vec::new();
        for row in rows {
            let bytes = row.context("Failed to read row")?;
            records.push(bincode::deserialize(&bytes).context("Failed to deserialize cached record")?);
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock()?;

        let total_entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM regrade_records", [], |row| row.get(0))
            .context("Failed to count entries")?;

        let total_size: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM regrade_records",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let assignment_count: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT assignment) FROM regrade_records",
                [],
                |row| row.get(0),
            )
            .context("Failed to count assignments")?;

        let classified: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM regrade_records WHERE outcome IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .context("Failed to count classified records")?;

        Ok(CacheStats {
            total_entries: total_entries as usize,
            total_size_bytes: total_size as usize,
            assignment_count: assignment_count as usize,
            classified_entries: classified as usize,
        })
    }

    /// Remove every cached record
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM regrade_records", [])
            .context("Failed to clear cache")?;

        debug!("Cache cleared");
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("VACUUM", []).context("Failed to vacuum")?;

        debug!("Database vacuumed");
        Ok(())
    }
}

impl Drop for RegradeCache {
    fn drop(&mut self) {
        // Fold the WAL back into the main file so it does not grow across runs
        if let Ok(conn) = self.conn.lock() {
            if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
                warn!("Failed to checkpoint WAL on RegradeCache drop: {}", e);
            } else {
                debug!("WAL checkpoint completed on RegradeCache drop");
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub assignment_count: usize,
    pub classified_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingEntry, Outcome, OutcomeLabel, ThreadDetail};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(student: &str, submission: u32) -> RequestRecord {
        let entry = ListingEntry::new(
            format!("https://www.gradescope.com/courses/1/questions/7/submissions/{}/grade", submission),
            student,
            "Question 7",
            "https://www.gradescope.com/courses/1/questions/7/submissions",
            "Grace",
        );
        RequestRecord::from_detail(&AssignmentId::new("1", "2"), &entry, ThreadDetail::default())
    }

    #[test]
    fn test_cache_creation() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert!(cache.path().ends_with(CACHE_FILE));
    }

    #[test]
    fn test_cache_put_get() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        let rec = record("Ada", 100);

        cache.put(&rec).unwrap();

        let cached = cache.get(&rec.cache_key()).unwrap().unwrap();
        assert_eq!(cached, rec);
        assert!(cache.get(&record("Ada", 101).cache_key()).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let rec = record("Ada", 100);
        {
            let cache = RegradeCache::open(dir.path()).unwrap();
            cache.put(&rec).unwrap();
        }

        let cache = RegradeCache::open(dir.path()).unwrap();
        assert_eq!(cache.get(&rec.cache_key()).unwrap(), Some(rec));
    }

    #[test]
    fn test_put_overwrites() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        let mut rec = record("Ada", 100);
        cache.put(&rec).unwrap();

        rec.outcome = Some(Outcome::new(OutcomeLabel::Accepted, 0.9));
        cache.put(&rec).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.classified_entries, 1);
        assert_eq!(
            cache.get(&rec.cache_key()).unwrap().unwrap().accepted(),
            Some(true)
        );
    }

    #[test]
    fn test_contains_fresh_honours_refresh() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        let rec = record("Ada", 100);
        let key = rec.cache_key();

        assert!(!cache.contains_fresh(&key, false).unwrap());
        cache.put(&rec).unwrap();
        assert!(cache.contains_fresh(&key, false).unwrap());
        assert!(!cache.contains_fresh(&key, true).unwrap());
    }

    #[test]
    fn test_cache_invalidate() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        let rec = record("Ada", 100);
        cache.put(&rec).unwrap();

        cache.invalidate(&rec.cache_key()).unwrap();

        assert!(cache.get(&rec.cache_key()).unwrap().is_none());
    }

    #[test]
    fn test_vacuum_after_invalidate_keeps_remaining_rows() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        let dropped = record("Ada", 100);
        let kept = record("Grace", 200);
        cache.put(&dropped).unwrap();
        cache.put(&kept).unwrap();

        cache.invalidate(&dropped.cache_key()).unwrap();
        cache.vacuum().unwrap();

        assert_eq!(cache.stats().unwrap().total_entries, 1);
        assert!(cache.get(&kept.cache_key()).unwrap().is_some());
    }

    #[test]
    fn test_assignment_records_are_scoped() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        for i in 0..3 {
            cache.put(&record("Ada", i)).unwrap();
        }

        assert_eq!(
            cache.assignment_records(&AssignmentId::new("1", "2")).unwrap().len(),
            3
        );
        assert!(cache
            .assignment_records(&AssignmentId::new("1", "3"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..5 {
                        cache.put(&record(&format!("student-{}", i), i * 100 + j)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.stats().unwrap().total_entries, 80);
        for i in 0..16 {
            for j in 0..5 {
                let rec = cache.get(&record("x", i * 100 + j).cache_key()).unwrap().unwrap();
                assert_eq!(rec.student, format!("student-{}", i));
            }
        }
    }

    #[test]
    fn test_cache_clear() {
        let dir = tempdir().unwrap();
        let cache = RegradeCache::open(dir.path()).unwrap();
        cache.put(&record("Ada", 1)).unwrap();
        assert_eq!(cache.stats().unwrap().total_entries, 1);

        cache.clear().unwrap();

        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }

    #[test]
    fn test_open_on_file_is_cache_init_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = RegradeCache::open(&blocker).err().unwrap();
        assert!(matches!(err, CoreError::CacheInit { .. }));
    }
}
