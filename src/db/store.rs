//! SQLite rollup store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::query::{FilterField, Granularity};

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("query abandoned by caller")]
    Abandoned,
}

/// Thread-safe rollup store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- Rollups ---

    /// Add pre-aggregated rows in batch.
    pub fn add_rollups(&self, records: &[RollupRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_rollups (metric_type, bucket_time, tenant_id, user_id, event_type, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for r in records {
                stmt.execute(params![
                    r.metric_type,
                    r.bucket_time.timestamp(),
                    r.tenant_id,
                    r.user_id,
                    r.event_type,
                    r.value,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Aggregate rollups for a metric over `[start, end)` into buckets of
    /// the given granularity, ordered by period ascending.
    ///
    /// Every caller-supplied value is a bound parameter. Filter column names
    /// come from [`FilterField`], never from the caller.
    ///
    /// `abandoned` is checked once the connection lock is held; a set flag
    /// returns [`StoreError::Abandoned`] without running the query.
    pub fn query_rollups(
        &self,
        metric_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        filters: &[(FilterField, &str)],
        abandoned: &AtomicBool,
    ) -> Result<Vec<AggregatedRow>, StoreError> {
        let mut sql = String::from(
            "SELECT bucket_time - (((bucket_time - ?5) % ?4) + ?4) % ?4 AS period,
                    SUM(value), COUNT(*), AVG(value)
             FROM metric_rollups
             WHERE metric_type = ?1 AND bucket_time >= ?2 AND bucket_time < ?3",
        );
        let mut values = vec![
            Value::Text(metric_type.to_string()),
            Value::Integer(ceil_seconds(start)),
            Value::Integer(ceil_seconds(end)),
            Value::Integer(granularity.bucket_seconds()),
            Value::Integer(granularity.bucket_offset()),
        ];

        for (field, value) in filters {
            values.push(Value::Text(value.to_string()));
            sql.push_str(&format!(" AND {} = ?{}", field.as_str(), values.len()));
        }
        sql.push_str(" GROUP BY period ORDER BY period ASC");

        let conn = self.lock()?;
        if abandoned.load(Ordering::Acquire) {
            return Err(StoreError::Abandoned);
        }
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(period, total, count, average)| {
                let period = DateTime::from_timestamp(period, 0)
                    .ok_or_else(|| StoreError::Malformed(format!("period out of range: {}", period)))?;
                Ok(AggregatedRow {
                    period,
                    total,
                    count,
                    average,
                })
            })
            .collect()
    }

    // --- Freshness metadata ---

    /// Record the time a rollup view was last refreshed.
    pub fn set_last_refresh(&self, view_name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mv_metadata (view_name, last_refresh) VALUES (?1, ?2)
             ON CONFLICT(view_name) DO UPDATE SET last_refresh=excluded.last_refresh",
            params![view_name, at.format(DB_TIME_FORMAT).to_string()],
        )?;
        Ok(())
    }

    /// Get the last refresh time of a rollup view, if one was recorded.
    pub fn get_last_refresh(&self, view_name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT last_refresh FROM mv_metadata WHERE view_name = ?1",
                params![view_name],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(s) => parse_db_time(&s)
                .map(Some)
                .ok_or_else(|| StoreError::Malformed(format!("unparseable refresh time: {}", s))),
            None => Ok(None),
        }
    }
}

/// Whole seconds at or after `dt`, so sub-second bounds stay half-open.
fn ceil_seconds(dt: DateTime<Utc>) -> i64 {
    if dt.timestamp_subsec_nanos() > 0 {
        dt.timestamp() + 1
    } else {
        dt.timestamp()
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
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
