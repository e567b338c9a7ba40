//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Timestamp format used for every time column.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with the embedded migration.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("migration failed: {}", e)))?;
        Ok(())
    }

    // --- Targets ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        if target.frequency_secs < 1 {
            target.frequency_secs = 1;
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (ip_address, frequency_secs, is_active, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.ip_address,
                target.frequency_secs,
                target.is_active,
                target.notes,
                target.created_at.format(TIME_FORMAT).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Get a target by ID, or `None` if it does not exist.
    pub fn get_target(&self, id: i64) -> Result<Option<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let target = conn
            .query_row(
                "SELECT id, ip_address, frequency_secs, is_active, notes, created_at
                 FROM targets WHERE id = ?1",
                params![id],
                row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    /// Get a target by its IP address.
    pub fn get_target_by_ip(&self, ip: &str) -> Result<Option<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let target = conn
            .query_row(
                "SELECT id, ip_address, frequency_secs, is_active, notes, created_at
                 FROM targets WHERE ip_address = ?1",
                params![ip],
                row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, frequency_secs, is_active, notes, created_at
             FROM targets ORDER BY id ASC",
        )?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get all targets currently marked active.
    pub fn get_active_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ip_address, frequency_secs, is_active, notes, created_at
             FROM targets WHERE is_active = 1 ORDER BY id ASC",
        )?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Update frequency and notes of an existing target.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let frequency = target.frequency_secs.max(1);
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE targets SET frequency_secs = ?1, notes = ?2 WHERE id = ?3",
            params![frequency, target.notes, target.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Flip the active flag of a target.
    pub fn set_target_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE targets SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a target together with its samples, events and rollups.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM ping_logs WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM event_logs WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM ping_rollups WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Ping samples ---

    /// Append a single probe result.
    pub fn add_ping(&self, sample: &PingSample) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ping_logs (time, target_id, latency_ms, hops, packet_loss)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.time.format(TIME_FORMAT).to_string(),
                sample.target_id,
                sample.latency_ms,
                sample.hops,
                sample.lost,
            ],
        )?;
        Ok(())
    }

    /// Get samples for a target within `[start, end]` (inclusive bounds).
    ///
    /// With `newest_first`, rows come back in descending time order and the
    /// limit keeps the most recent ones, silently dropping the oldest.
    pub fn get_ping_samples(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        newest_first: bool,
    ) -> Result<Vec<PingSample>, DbError> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time >= ?2 AND time <= ?3
             ORDER BY time {} LIMIT ?4",
            order
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let samples = stmt
            .query_map(
                params![
                    target_id,
                    start.format(TIME_FORMAT).to_string(),
                    end.format(TIME_FORMAT).to_string(),
                    limit,
                ],
                row_to_sample,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Get the most recent samples for a target, newest last.
    pub fn recent_pings(&self, target_id: i64, limit: i64) -> Result<Vec<PingSample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let mut samples = stmt
            .query_map(params![target_id, limit], row_to_sample)?
            .collect::<SqlResult<Vec<_>>>()?;
        samples.reverse();
        Ok(samples)
    }

    /// Earliest sample time for a target, if any samples exist.
    pub fn earliest_ping_time(&self, target_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM ping_logs WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    // --- Events ---

    /// Append an event stamped with the current time.
    pub fn add_event(
        &self,
        target_id: Option<i64>,
        kind: EventKind,
        message: &str,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_logs (target_id, event_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target_id,
                kind.as_str(),
                message,
                Utc::now().format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(())
    }

    /// Get events for a target, most recent first, optionally range-bounded.
    pub fn get_events(
        &self,
        target_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, DbError> {
        let mut sql = String::from(
            "SELECT id, target_id, event_type, message, created_at FROM event_logs
             WHERE target_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(target_id)];

        if let Some(start) = start {
            args.push(Box::new(start.format(TIME_FORMAT).to_string()));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(end) = end {
            args.push(Box::new(end.format(TIME_FORMAT).to_string()));
            sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
        }
        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT ?{}", args.len()));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_event)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Rollups ---

    /// Upsert rollup rows in batch.
    pub fn upsert_rollups(&self, rows: &[RollupRow]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ping_rollups
                   (bucket, target_id, granularity_secs, samples, loss_count,
                    avg_latency_ms, min_latency_ms, max_latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(target_id, granularity_secs, bucket) DO UPDATE SET
                   samples = excluded.samples,
                   loss_count = excluded.loss_count,
                   avg_latency_ms = excluded.avg_latency_ms,
                   min_latency_ms = excluded.min_latency_ms,
                   max_latency_ms = excluded.max_latency_ms",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.bucket.format(TIME_FORMAT).to_string(),
                    r.target_id,
                    r.granularity_secs,
                    r.samples,
                    r.loss_count,
                    r.avg_latency_ms,
                    r.min_latency_ms,
                    r.max_latency_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get rollup rows for a target and granularity within `[start, end)`.
    pub fn get_rollups(
        &self,
        target_id: i64,
        granularity_secs: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RollupRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT bucket, target_id, granularity_secs, samples, loss_count,
                    avg_latency_ms, min_latency_ms, max_latency_ms
             FROM ping_rollups
             WHERE target_id = ?1 AND granularity_secs = ?2
               AND bucket >= ?3 AND bucket < ?4
             ORDER BY bucket ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    target_id,
                    granularity_secs,
                    start.format(TIME_FORMAT).to_string(),
                    end.format(TIME_FORMAT).to_string(),
                ],
                row_to_rollup,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Start time of the most recent rollup bucket for a target and granularity.
    pub fn last_rollup_bucket(
        &self,
        target_id: i64,
        granularity_secs: i64,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(bucket) FROM ping_rollups
             WHERE target_id = ?1 AND granularity_secs = ?2",
            params![target_id, granularity_secs],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }
}

fn row_to_target(row: &rusqlite::Row<'_>) -> SqlResult<Target> {
    let created_str: String = row.get(5)?;
    Ok(Target {
        id: row.get(0)?,
        ip_address: row.get(1)?,
        frequency_secs: row.get(2)?,
        is_active: row.get(3)?,
        notes: row.get(4)?,
        created_at: parse_db_time(&created_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> SqlResult<PingSample> {
    let time_str: String = row.get(0)?;
    Ok(PingSample {
        time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
        target_id: row.get(1)?,
        latency_ms: row.get(2)?,
        hops: row.get(3)?,
        lost: row.get(4)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> SqlResult<EventRecord> {
    let kind_str: String = row.get(2)?;
    let created_str: String = row.get(4)?;
    Ok(EventRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        kind: EventKind::parse(&kind_str).unwrap_or(EventKind::Stop),
        message: row.get(3)?,
        created_at: parse_db_time(&created_str).unwrap_or_else(Utc::now),
    })
}

fn row_to_rollup(row: &rusqlite::Row<'_>) -> SqlResult<RollupRow> {
    let bucket_str: String = row.get(0)?;
    Ok(RollupRow {
        bucket: parse_db_time(&bucket_str).unwrap_or_else(Utc::now),
        target_id: row.get(1)?,
        granularity_secs: row.get(2)?,
        samples: row.get(3)?,
        loss_count: row.get(4)?,
        avg_latency_ms: row.get(5)?,
        min_latency_ms: row.get(6)?,
        max_latency_ms: row.get(7)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_target_crud() {
        let (_tmp, store) = open_store();

        let mut target = Target {
            ip_address: "192.0.2.1".to_string(),
            frequency_secs: 5,
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        let fetched = store.get_target(id).unwrap().unwrap();
        assert_eq!(fetched.ip_address, "192.0.2.1");
        assert_eq!(fetched.frequency_secs, 5);
        assert!(fetched.is_active);

        let mut updated = fetched;
        updated.frequency_secs = 30;
        updated.notes = Some("edge router".to_string());
        store.update_target(&updated).unwrap();

        let fetched2 = store.get_target(id).unwrap().unwrap();
        assert_eq!(fetched2.frequency_secs, 30);
        assert_eq!(fetched2.notes.as_deref(), Some("edge router"));

        store.set_target_active(id, false).unwrap();
        assert!(store.get_active_targets().unwrap().is_empty());

        store.delete_target(id).unwrap();
        assert!(store.get_target(id).unwrap().is_none());
    }

    #[test]
    fn test_missing_target_is_none() {
        let (_tmp, store) = open_store();
        assert!(store.get_target(999).unwrap().is_none());
        assert!(matches!(
            store.update_target(&Target {
                id: 999,
                ..Default::default()
            }),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_ping_query_keeps_most_recent() {
        let (_tmp, store) = open_store();
        let mut target = Target {
            ip_address: "192.0.2.2".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();

        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for i in 0..10 {
            store
                .add_ping(&PingSample {
                    time: base + Duration::seconds(i),
                    target_id: id,
                    latency_ms: Some(10.0 + i as f64),
                    hops: Some(6),
                    lost: false,
                })
                .unwrap();
        }

        let newest = store
            .get_ping_samples(id, base, base + Duration::seconds(60), 3, true)
            .unwrap();
        assert_eq!(newest.len(), 3);
        // Descending order, oldest rows dropped by the limit.
        assert_eq!(newest[0].latency_ms, Some(19.0));
        assert_eq!(newest[2].latency_ms, Some(17.0));

        let recent = store.recent_pings(id, 5).unwrap();
        assert_eq!(recent.len(), 5);
        assert!(recent[0].time < recent[4].time);
    }

    #[test]
    fn test_event_range_query() {
        let (_tmp, store) = open_store();
        store.add_event(Some(1), EventKind::Start, "Tracking started").unwrap();
        store.add_event(Some(1), EventKind::Failure, "down").unwrap();
        store.add_event(Some(2), EventKind::Start, "other target").unwrap();

        let events = store.get_events(1, None, None, 100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Failure);

        let none = store
            .get_events(1, None, Some(Utc::now() - Duration::days(1)), 100)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_rollup_upsert_overwrites() {
        let (_tmp, store) = open_store();
        let bucket = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let row = RollupRow {
            bucket,
            target_id: 1,
            granularity_secs: 60,
            samples: 60,
            loss_count: 2,
            avg_latency_ms: Some(12.5),
            min_latency_ms: Some(9.0),
            max_latency_ms: Some(40.0),
        };
        store.upsert_rollups(std::slice::from_ref(&row)).unwrap();

        let replaced = RollupRow {
            samples: 61,
            loss_count: 3,
            ..row
        };
        store.upsert_rollups(&[replaced]).unwrap();

        let rows = store
            .get_rollups(1, 60, bucket, bucket + Duration::seconds(60))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].samples, 61);
        assert_eq!(rows[0].loss_count, 3);

        let last = store.last_rollup_bucket(1, 60).unwrap();
        assert_eq!(last, Some(bucket));
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2025-06-01 12:00:00.123456789").is_some());
        assert!(parse_db_time("2025-06-01 12:00:00").is_some());
        assert!(parse_db_time("2025-06-01T12:00:00Z").is_some());
        assert!(parse_db_time("not a time").is_none());
    }
}
