//! Result cache backed by SQLite: TTL-bounded outcomes and failure streaks.
//!
//! Writes go to an in-memory buffer first and are committed in one
//! transaction when the buffer fills up or on [`ResultCache::flush`].
//! Lookups see buffered writes before they reach disk.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::outcome::{ErrorKind, OutcomeOrigin, ProbeOutcome};

const SELECT_ENTRY: &str =
    "SELECT target_id, success, latency_ms, error_kind, error_code, response_snippet,
            attempts, probed_at, last_tested_at, expires_at, failure_streak
     FROM probe_cache WHERE target_id = ?1";

/// The cached state of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub target_id: String,
    pub last_outcome: ProbeOutcome,
    pub failure_streak: u32,
    pub last_tested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Aggregate numbers over every committed row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_success_latency_ms: Option<f64>,
}

/// A target whose streak is at or above some threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistentFailure {
    pub target_id: String,
    pub failure_streak: u32,
    pub last_error_code: String,
    pub last_tested_at: DateTime<Utc>,
}

/// The result cache backed by SQLite.
pub struct ResultCache {
    db: Mutex<Connection>,
    /// Pending writes, keyed by target. Lock order: `buffer` before `db`.
    buffer: Mutex<HashMap<String, CacheEntry>>,
    ttl: chrono::Duration,
    buffer_size: usize,
}

impl ResultCache {
    /// Open (or create) the cache at the given path.
    pub fn open(db_path: &Path, ttl: chrono::Duration, buffer_size: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(db_path)?;
        // WAL mode for concurrent readers (reporting tools)
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db, ttl, buffer_size)
    }

    /// Cache that lives only as long as the process.
    pub fn open_in_memory(ttl: chrono::Duration, buffer_size: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ttl, buffer_size)
    }

    fn init(db: Connection, ttl: chrono::Duration, buffer_size: usize) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS probe_cache (
                target_id TEXT PRIMARY KEY,
                success INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                error_kind TEXT,
                error_code TEXT NOT NULL DEFAULT '',
                response_snippet TEXT NOT NULL DEFAULT '',
                attempts INTEGER NOT NULL DEFAULT 0,
                probed_at TEXT NOT NULL,
                last_tested_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                failure_streak INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_probe_cache_streak ON probe_cache(failure_streak);
            ",
        )?;

        Ok(Self {
            db: Mutex::new(db),
            buffer: Mutex::new(HashMap::new()),
            ttl,
            buffer_size: buffer_size.max(1),
        })
    }

    // ── Lookup ──

    /// The entry for a target, if it has not expired.
    pub fn lookup(&self, target_id: &str) -> Result<Option<CacheEntry>> {
        self.lookup_at(target_id, Utc::now())
    }

    pub fn lookup_at(&self, target_id: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        Ok(self.peek(target_id)?.filter(|e| e.is_fresh(now)))
    }

    /// The entry for a target regardless of expiry.
    pub fn peek(&self, target_id: &str) -> Result<Option<CacheEntry>> {
        let buffer = self.lock_buffer()?;
        if let Some(entry) = buffer.get(target_id) {
            return Ok(Some(entry.clone()));
        }
        let db = self.lock_db()?;
        read_entry(&db, target_id)
    }

    /// Consecutive failures recorded for a target. Ignores expiry.
    pub fn failure_streak(&self, target_id: &str) -> Result<u32> {
        Ok(self.peek(target_id)?.map(|e| e.failure_streak).unwrap_or(0))
    }

    // ── Update ──

    /// Record a fresh outcome for a target.
    pub fn update(&self, target_id: &str, outcome: &ProbeOutcome) -> Result<CacheEntry> {
        self.update_at(target_id, outcome, Utc::now())
    }

    pub fn update_at(
        &self,
        target_id: &str,
        outcome: &ProbeOutcome,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let mut buffer = self.lock_buffer()?;

        let previous_streak = match buffer.get(target_id) {
            Some(entry) => entry.failure_streak,
            None => {
                let db = self.lock_db()?;
                read_entry(&db, target_id)?.map(|e| e.failure_streak).unwrap_or(0)
            }
        };
        let failure_streak = if outcome.success {
            0
        } else {
            previous_streak.saturating_add(1)
        };

        let entry = CacheEntry {
            target_id: target_id.to_string(),
            last_outcome: outcome.clone().with_origin(OutcomeOrigin::Probed),
            failure_streak,
            last_tested_at: now,
            // Out-of-range expiry is stored as already stale
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(now),
        };
        buffer.insert(target_id.to_string(), entry.clone());

        if buffer.len() >= self.buffer_size {
            self.commit(&mut buffer)?;
        }
        Ok(entry)
    }

    /// Commit all buffered writes. Returns how many rows were written.
    pub fn flush(&self) -> Result<usize> {
        let mut buffer = self.lock_buffer()?;
        self.commit(&mut buffer)
    }

    /// Number of writes waiting for the next commit.
    pub fn pending(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn commit(&self, buffer: &mut HashMap<String, CacheEntry>) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut db = self.lock_db()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_cache (target_id, success, latency_ms, error_kind, error_code,
                    response_snippet, attempts, probed_at, last_tested_at, expires_at, failure_streak)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(target_id) DO UPDATE SET
                    success = excluded.success,
                    latency_ms = excluded.latency_ms,
                    error_kind = excluded.error_kind,
                    error_code = excluded.error_code,
                    response_snippet = excluded.response_snippet,
                    attempts = excluded.attempts,
                    probed_at = excluded.probed_at,
                    last_tested_at = excluded.last_tested_at,
                    expires_at = excluded.expires_at,
                    failure_streak = excluded.failure_streak",
            )?;

            for entry in buffer.values() {
                let o = &entry.last_outcome;
                stmt.execute(params![
                    entry.target_id,
                    o.success,
                    o.latency_ms as i64,
                    o.error_kind.map(|k| k.as_str()),
                    o.error_code,
                    o.response_snippet,
                    o.attempts as i64,
                    format_ts(&o.timestamp),
                    format_ts(&entry.last_tested_at),
                    format_ts(&entry.expires_at),
                    entry.failure_streak as i64,
                ])?;
            }
        }
        tx.commit()?;

        let written = buffer.len();
        buffer.clear();
        debug!(rows = written, "Cache buffer committed");
        Ok(written)
    }

    // ── Maintenance ──

    /// Forget everything about one target.
    pub fn reset(&self, target_id: &str) -> Result<bool> {
        let mut buffer = self.lock_buffer()?;
        let buffered = buffer.remove(target_id).is_some();
        let db = self.lock_db()?;
        let rows = db.execute("DELETE FROM probe_cache WHERE target_id = ?1", params![target_id])?;
        Ok(buffered || rows > 0)
    }

    /// Zero every failure streak. Returns the number of rows touched.
    pub fn reset_failure_streaks(&self) -> Result<usize> {
        let mut buffer = self.lock_buffer()?;
        self.commit(&mut buffer)?;
        let db = self.lock_db()?;
        let rows = db.execute(
            "UPDATE probe_cache SET failure_streak = 0 WHERE failure_streak > 0",
            [],
        )?;
        Ok(rows)
    }

    /// Drop every entry, buffered or committed.
    pub fn clear(&self) -> Result<()> {
        let mut buffer = self.lock_buffer()?;
        buffer.clear();
        let db = self.lock_db()?;
        db.execute("DELETE FROM probe_cache", [])?;
        Ok(())
    }

    /// Targets failing at least `threshold` times in a row, worst first.
    pub fn persistent_failures(&self, threshold: u32) -> Result<Vec<PersistentFailure>> {
        let mut buffer = self.lock_buffer()?;
        self.commit(&mut buffer)?;
        let db = self.lock_db()?;
        let mut stmt = db.prepare(
            "SELECT target_id, failure_streak, error_code, last_tested_at
             FROM probe_cache
             WHERE failure_streak >= ?1
             ORDER BY failure_streak DESC, target_id ASC",
        )?;
        let rows = stmt
            .query_map(params![threshold as i64], |row| {
                Ok(PersistentFailure {
                    target_id: row.get(0)?,
                    failure_streak: row.get::<_, i64>(1)? as u32,
                    last_error_code: row.get(2)?,
                    last_tested_at: parse_ts(3, row.get(3)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every target whose last outcome was a failure, expired or not.
    pub fn failed_targets(&self) -> Result<Vec<String>> {
        let mut buffer = self.lock_buffer()?;
        self.commit(&mut buffer)?;
        let db = self.lock_db()?;
        let mut stmt = db.prepare("SELECT target_id FROM probe_cache WHERE success = 0 ORDER BY target_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut buffer = self.lock_buffer()?;
        self.commit(&mut buffer)?;
        let db = self.lock_db()?;
        let stats = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0),
                    AVG(CASE WHEN success = 1 THEN latency_ms ELSE NULL END)
             FROM probe_cache",
            [],
            |row| {
                Ok(CacheStats {
                    total: row.get::<_, i64>(0)? as u64,
                    successes: row.get::<_, i64>(1)? as u64,
                    failures: row.get::<_, i64>(2)? as u64,
                    avg_success_latency_ms: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    fn lock_buffer(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>> {
        self.buffer.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| EngineError::LockPoisoned)
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        // Commit whatever is still buffered
        if let Err(e) = self.flush() {
            warn!("Failed to flush result cache on drop: {}", e);
        }
    }
}

fn read_entry(db: &Connection, target_id: &str) -> Result<Option<CacheEntry>> {
    let entry = db
        .query_row(SELECT_ENTRY, params![target_id], entry_from_row)
        .optional()?;
    Ok(entry)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let target_id: String = row.get(0)?;
    let error_kind = row
        .get::<_, Option<String>>(3)?
        .as_deref()
        .and_then(ErrorKind::parse);

    let outcome = ProbeOutcome {
        target_id: target_id.clone(),
        success: row.get(1)?,
        latency_ms: row.get::<_, i64>(2)? as u64,
        error_kind,
        error_code: row.get(4)?,
        response_snippet: row.get(5)?,
        attempts: row.get::<_, i64>(6)? as u32,
        timestamp: parse_ts(7, row.get(7)?)?,
        origin: OutcomeOrigin::Probed,
    };

    Ok(CacheEntry {
        target_id,
        last_outcome: outcome,
        last_tested_at: parse_ts(8, row.get(8)?)?,
        expires_at: parse_ts(9, row.get(9)?)?,
        failure_streak: row.get::<_, i64>(10)? as u32,
    })
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn outcome(id: &str, success: bool, at: DateTime<Utc>) -> ProbeOutcome {
        ProbeOutcome {
            target_id: id.to_string(),
            success,
            latency_ms: if success { 420 } else { 30_000 },
            error_kind: if success { None } else { Some(ErrorKind::Transient) },
            error_code: if success { String::new() } else { "TIMEOUT".into() },
            response_snippet: if success { "Hello! How can I help?".into() } else { String::new() },
            timestamp: at,
            attempts: if success { 1 } else { 3 },
            origin: OutcomeOrigin::Probed,
        }
    }

    fn memory_cache(buffer: usize) -> ResultCache {
        ResultCache::open_in_memory(Duration::hours(24), buffer).unwrap()
    }

    #[test]
    fn test_lookup_sees_buffered_write() {
        let cache = memory_cache(50);
        cache.update_at("gpt-4o", &outcome("gpt-4o", true, t0()), t0()).unwrap();
        assert_eq!(cache.pending(), 1);

        let entry = cache.lookup_at("gpt-4o", t0()).unwrap().expect("buffered entry visible");
        assert!(entry.last_outcome.success);
        assert_eq!(entry.failure_streak, 0);
        assert_eq!(entry.expires_at, t0() + Duration::hours(24));
    }

    #[test]
    fn test_missing_target_is_absent() {
        let cache = memory_cache(50);
        assert!(cache.lookup("nope").unwrap().is_none());
        assert_eq!(cache.failure_streak("nope").unwrap(), 0);
    }

    #[test]
    fn test_streak_resets_on_first_success() {
        let cache = memory_cache(2);
        for i in 0..3 {
            let at = t0() + Duration::minutes(i);
            let entry = cache.update_at("m", &outcome("m", false, at), at).unwrap();
            assert_eq!(entry.failure_streak, (i + 1) as u32);
        }
        assert_eq!(cache.failure_streak("m").unwrap(), 3);

        let entry = cache.update_at("m", &outcome("m", true, t0()), t0()).unwrap();
        assert_eq!(entry.failure_streak, 0);
        assert_eq!(cache.failure_streak("m").unwrap(), 0);
    }

    #[test]
    fn test_ttl_boundaries() {
        let cache = memory_cache(50);
        cache.update_at("m", &outcome("m", true, t0()), t0()).unwrap();
        cache.flush().unwrap();

        assert!(cache.lookup_at("m", t0() + Duration::hours(23)).unwrap().is_some());
        assert!(cache.lookup_at("m", t0() + Duration::hours(25)).unwrap().is_none());
        // Exactly at expiry the entry is no longer trusted
        assert!(cache.lookup_at("m", t0() + Duration::hours(24)).unwrap().is_none());
        // Stale entries are ignored, not deleted
        assert!(cache.peek("m").unwrap().is_some());
    }

    #[test]
    fn test_unrepresentable_expiry_does_not_panic() {
        let cache = ResultCache::open_in_memory(Duration::weeks(1_000_000_000), 50).unwrap();
        let entry = cache.update_at("m", &outcome("m", false, t0()), t0()).unwrap();
        assert_eq!(entry.expires_at, t0());
        assert_eq!(entry.failure_streak, 1);
        assert!(cache.lookup_at("m", t0()).unwrap().is_none());
        cache.flush().unwrap();
        assert_eq!(cache.failure_streak("m").unwrap(), 1);
    }

    #[test]
    fn test_streak_survives_expiry() {
        let cache = memory_cache(50);
        cache.update_at("m", &outcome("m", false, t0()), t0()).unwrap();
        let later = t0() + Duration::hours(48);
        assert!(cache.lookup_at("m", later).unwrap().is_none());
        assert_eq!(cache.failure_streak("m").unwrap(), 1);

        let entry = cache.update_at("m", &outcome("m", false, later), later).unwrap();
        assert_eq!(entry.failure_streak, 2);
    }

    #[test]
    fn test_buffer_commits_at_threshold() {
        let cache = memory_cache(3);
        cache.update_at("a", &outcome("a", true, t0()), t0()).unwrap();
        cache.update_at("b", &outcome("b", true, t0()), t0()).unwrap();
        assert_eq!(cache.pending(), 2);
        cache.update_at("c", &outcome("c", true, t0()), t0()).unwrap();
        assert_eq!(cache.pending(), 0);
        assert_eq!(cache.stats().unwrap().total, 3);
    }

    #[test]
    fn test_repeated_updates_coalesce_in_buffer() {
        let cache = memory_cache(10);
        for _ in 0..4 {
            cache.update_at("same", &outcome("same", false, t0()), t0()).unwrap();
        }
        assert_eq!(cache.pending(), 1);
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.failure_streak("same").unwrap(), 4);
    }

    #[test]
    fn test_flush_then_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::nanoseconds(123_456_789);

        let mut written = Vec::new();
        {
            let cache = ResultCache::open(&path, Duration::hours(24), 100).unwrap();
            for i in 0..25 {
                let id = format!("model-{i:02}");
                let mut o = outcome(&id, i % 3 != 0, at + Duration::seconds(i));
                o.response_snippet = format!("回答 {i}: ok");
                cache.update_at(&id, &o, at).unwrap();
                written.push(o);
            }
            assert_eq!(cache.flush().unwrap(), 25);
        }

        let reopened = ResultCache::open(&path, Duration::hours(24), 100).unwrap();
        for o in &written {
            let entry = reopened.lookup_at(&o.target_id, at).unwrap().expect("entry persisted");
            assert_eq!(&entry.last_outcome, o);
            assert_eq!(entry.last_tested_at, at);
        }
    }

    #[test]
    fn test_drop_flushes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = ResultCache::open(&path, Duration::hours(24), 100).unwrap();
            cache.update("m", &outcome("m", true, Utc::now())).unwrap();
            assert_eq!(cache.pending(), 1);
        }
        let reopened = ResultCache::open(&path, Duration::hours(24), 100).unwrap();
        assert!(reopened.lookup("m").unwrap().is_some());
    }

    #[test]
    fn test_persistent_failures_and_reset() {
        let cache = memory_cache(50);
        for _ in 0..4 {
            cache.update_at("bad", &outcome("bad", false, t0()), t0()).unwrap();
        }
        cache.update_at("flaky", &outcome("flaky", false, t0()), t0()).unwrap();
        cache.update_at("good", &outcome("good", true, t0()), t0()).unwrap();

        let failures = cache.persistent_failures(3).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target_id, "bad");
        assert_eq!(failures[0].failure_streak, 4);
        assert_eq!(failures[0].last_error_code, "TIMEOUT");

        assert_eq!(cache.reset_failure_streaks().unwrap(), 2);
        assert_eq!(cache.failure_streak("bad").unwrap(), 0);
        assert!(cache.persistent_failures(1).unwrap().is_empty());
    }

    #[test]
    fn test_reset_and_clear() {
        let cache = memory_cache(50);
        cache.update_at("a", &outcome("a", true, t0()), t0()).unwrap();
        cache.flush().unwrap();
        cache.update_at("b", &outcome("b", true, t0()), t0()).unwrap();

        assert!(cache.reset("a").unwrap());
        assert!(!cache.reset("a").unwrap());
        assert!(cache.peek("a").unwrap().is_none());

        cache.clear().unwrap();
        assert!(cache.peek("b").unwrap().is_none());
        assert_eq!(cache.stats().unwrap().total, 0);
    }

    #[test]
    fn test_failed_targets() {
        let cache = memory_cache(50);
        cache.update_at("b-broken", &outcome("b-broken", false, t0()), t0()).unwrap();
        cache.update_at("a-broken", &outcome("a-broken", false, t0()), t0()).unwrap();
        cache.update_at("good", &outcome("good", true, t0()), t0()).unwrap();
        cache.update_at("healed", &outcome("healed", false, t0()), t0()).unwrap();
        cache.update_at("healed", &outcome("healed", true, t0()), t0()).unwrap();

        assert_eq!(cache.failed_targets().unwrap(), vec!["a-broken".to_string(), "b-broken".to_string()]);
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn test_stats() {
        let cache = memory_cache(50);
        cache.update_at("a", &outcome("a", true, t0()), t0()).unwrap();
        cache.update_at("b", &outcome("b", true, t0()), t0()).unwrap();
        cache.update_at("c", &outcome("c", false, t0()), t0()).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.avg_success_latency_ms, Some(420.0));
    }
}
