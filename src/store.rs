//! Sample store
//! Mission: durable, queryable time-series storage for fleet metrics
//!
//! Schema and locking follow the single `Arc<Mutex<Connection>>` pattern:
//! one writer transaction at a time, WAL journal mode so readers never
//! block behind it.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A single metric observation. `tags` is stored and returned verbatim;
/// the store never parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub metric_type: String,
    pub host: String,
    #[serde(default)]
    pub tags: String,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct WriteBatchResult {
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total_hosts: i64,
    pub online_hosts: i64,
    pub offline_hosts: i64,
    pub avg_cpu_usage: f64,
    pub total_memory_used: f64,
    pub timestamp: i64,
}

const CPU_METRIC: &str = "cpu.total_usage";
const MEMORY_METRIC: &str = "memory.used_bytes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Raw,
    OneMinute,
    OneHour,
}

impl Resolution {
    fn table(self) -> &'static str {
        match self {
            Resolution::Raw => "samples_raw",
            Resolution::OneMinute => "samples_1m",
            Resolution::OneHour => "samples_1h",
        }
    }
}

#[derive(Debug, Default)]
pub struct RangeQuery<'a> {
    pub host: Option<&'a str>,
    pub metric_type: Option<&'a str>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 1000;

/// Non-host-scoped range-query resolution thresholds, in seconds.
const RAW_WINDOW_SECS: i64 = 24 * 3600;
const ONE_MIN_WINDOW_SECS: i64 = 30 * 24 * 3600;

#[derive(Clone)]
pub struct SampleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SampleStore {
    pub fn new(db_path: &str) -> AppResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(SampleStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn init_schema(conn: &Connection) -> AppResult<()> {
        for table in ["samples_raw", "samples_1m", "samples_1h"] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    timestamp INTEGER NOT NULL,
                    metric_type TEXT NOT NULL,
                    host TEXT NOT NULL,
                    tags TEXT NOT NULL DEFAULT '',
                    value REAL NOT NULL,
                    PRIMARY KEY (timestamp, metric_type, host, tags)
                ) WITHOUT ROWID;
                CREATE INDEX IF NOT EXISTS idx_{table}_host_ts ON {table}(host, timestamp DESC);
                CREATE INDEX IF NOT EXISTS idx_{table}_metric_host_ts ON {table}(metric_type, host, timestamp DESC);
                CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table}(timestamp DESC);"
            ))?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                hostname TEXT PRIMARY KEY,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                version TEXT,
                platform TEXT,
                status TEXT NOT NULL DEFAULT 'active'
            );",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS baselines (
                metric_type TEXT NOT NULL,
                host TEXT NOT NULL,
                mean REAL NOT NULL,
                stddev REAL NOT NULL,
                min_value REAL NOT NULL,
                max_value REAL NOT NULL,
                percentile_95 REAL NOT NULL,
                percentile_99 REAL NOT NULL,
                sample_count INTEGER NOT NULL,
                last_updated INTEGER NOT NULL,
                PRIMARY KEY (metric_type, host)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_baselines_updated ON baselines(last_updated);",
        )?;

        Ok(())
    }

    /// Write a batch of samples for `hostname`, atomically updating the
    /// host's `last_seen`/`status` in the same transaction. Per-row
    /// validation failures are counted, never fatal to the batch.
    pub fn write_batch(&self, hostname: &str, samples: &[Sample]) -> AppResult<WriteBatchResult> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut result = WriteBatchResult::default();
        let now = Utc::now().timestamp();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO samples_raw
                 (timestamp, metric_type, host, tags, value) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for sample in samples {
                if !sample.value.is_finite() {
                    result.failed_count += 1;
                    continue;
                }
                stmt.execute(params![
                    sample.timestamp,
                    sample.metric_type,
                    hostname,
                    sample.tags,
                    sample.value,
                ])?;
                result.success_count += 1;
            }
        }

        tx.execute(
            "UPDATE hosts SET last_seen = MAX(last_seen, ?1), status = 'active' WHERE hostname = ?2",
            params![now, hostname],
        )?;

        tx.commit()?;
        Ok(result)
    }

    /// Range query. `host` is required unless the caller wants a
    /// fleet-wide query, in which case resolution is auto-selected based
    /// on the requested window. `start > end` returns an empty result,
    /// never an error.
    pub fn query_range(&self, query: RangeQuery) -> AppResult<Vec<Sample>> {
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let resolution = if query.host.is_some() {
            Resolution::Raw
        } else {
            select_resolution(query.start, query.end)
        };

        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let conn = self.conn.lock();
        let table = resolution.table();

        let mut sql = format!("SELECT timestamp, metric_type, host, tags, value FROM {table} WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(host) = query.host {
            sql.push_str(" AND host = ?");
            binds.push(Box::new(host.to_string()));
        }
        if let Some(metric_type) = query.metric_type {
            sql.push_str(" AND metric_type = ?");
            binds.push(Box::new(metric_type.to_string()));
        }
        if let Some(start) = query.start {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Box::new(start));
        }
        if let Some(end) = query.end {
            sql.push_str(" AND timestamp <= ?");
            binds.push(Box::new(end));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        binds.push(Box::new(limit));

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), row_to_sample)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest value per metric_type, optionally scoped to one host.
    /// Expressed as a single query with a correlated MAX-timestamp join
    /// so it scales past large host counts.
    pub fn latest_per_metric(&self, host: Option<&str>) -> AppResult<Vec<Sample>> {
        let conn = self.conn.lock();

        let rows = if let Some(host) = host {
            let mut stmt = conn.prepare(
                "SELECT s.timestamp, s.metric_type, s.host, s.tags, s.value
                 FROM samples_raw s
                 INNER JOIN (
                     SELECT metric_type, MAX(timestamp) AS max_ts
                     FROM samples_raw WHERE host = ?1
                     GROUP BY metric_type
                 ) latest ON s.metric_type = latest.metric_type AND s.timestamp = latest.max_ts
                 WHERE s.host = ?1",
            )?;
            stmt.query_map(params![host], row_to_sample)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT s.timestamp, s.metric_type, s.host, s.tags, s.value
                 FROM samples_raw s
                 INNER JOIN (
                     SELECT metric_type, host, MAX(timestamp) AS max_ts
                     FROM samples_raw
                     GROUP BY metric_type, host
                 ) latest ON s.metric_type = latest.metric_type
                     AND s.host = latest.host AND s.timestamp = latest.max_ts",
            )?;
            stmt.query_map([], row_to_sample)?
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(rows)
    }

    /// Delete raw samples older than `retention_secs`. Runs as its own
    /// short transaction so it never blocks ingest for longer than one
    /// commit.
    pub fn apply_retention(&self, resolution: Resolution, retention_secs: i64) -> AppResult<usize> {
        let cutoff = Utc::now().timestamp() - retention_secs;
        let conn = self.conn.lock();
        let table = resolution.table();
        let deleted = conn.execute(
            &format!("DELETE FROM {table} WHERE timestamp < ?1"),
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Materialize `samples_1m`/`samples_1h` rollups from the next finer
    /// resolution. Idempotent: re-running recomputes the same buckets via
    /// INSERT OR REPLACE.
    pub fn run_rollup(&self) -> AppResult<(usize, usize)> {
        let conn = self.conn.lock();

        let minute_rows = conn.execute(
            "INSERT OR REPLACE INTO samples_1m (timestamp, metric_type, host, tags, value)
             SELECT (timestamp / 60) * 60, metric_type, host, tags, AVG(value)
             FROM samples_raw
             GROUP BY (timestamp / 60), metric_type, host, tags",
            [],
        )?;

        let hour_rows = conn.execute(
            "INSERT OR REPLACE INTO samples_1h (timestamp, metric_type, host, tags, value)
             SELECT (timestamp / 3600) * 3600, metric_type, host, tags, AVG(value)
             FROM samples_1m
             GROUP BY (timestamp / 3600), metric_type, host, tags",
            [],
        )?;

        Ok((minute_rows, hour_rows))
    }

    /// Fleet-wide snapshot: host counts plus average CPU usage and total
    /// memory used across online hosts, each computed from that host's
    /// latest sample for the relevant metric.
    pub fn fleet_summary(&self, liveness_window_secs: i64) -> AppResult<FleetSummary> {
        let now = Utc::now().timestamp();
        let cutoff = now - liveness_window_secs;
        let conn = self.conn.lock();

        let total_hosts: i64 = conn.query_row("SELECT COUNT(*) FROM hosts", [], |row| row.get(0))?;
        let online_hosts: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hosts WHERE last_seen > ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        let offline_hosts = total_hosts - online_hosts;

        let avg_cpu: Option<f64> = conn.query_row(
            "SELECT AVG(value) FROM (
                SELECT m.value FROM samples_raw m
                INNER JOIN hosts h ON m.host = h.hostname
                INNER JOIN (
                    SELECT host, MAX(timestamp) AS max_ts
                    FROM samples_raw WHERE metric_type = ?2
                    GROUP BY host
                ) latest ON m.host = latest.host AND m.timestamp = latest.max_ts
                WHERE h.last_seen > ?1 AND m.metric_type = ?2
            )",
            params![cutoff, CPU_METRIC],
            |row| row.get(0),
        )?;

        let total_memory: Option<f64> = conn.query_row(
            "SELECT SUM(value) FROM (
                SELECT m.value FROM samples_raw m
                INNER JOIN hosts h ON m.host = h.hostname
                INNER JOIN (
                    SELECT host, MAX(timestamp) AS max_ts
                    FROM samples_raw WHERE metric_type = ?2
                    GROUP BY host
                ) latest ON m.host = latest.host AND m.timestamp = latest.max_ts
                WHERE h.last_seen > ?1 AND m.metric_type = ?2
            )",
            params![cutoff, MEMORY_METRIC],
            |row| row.get(0),
        )?;

        Ok(FleetSummary {
            total_hosts,
            online_hosts,
            offline_hosts,
            avg_cpu_usage: avg_cpu.unwrap_or(0.0),
            total_memory_used: total_memory.unwrap_or(0.0),
            timestamp: now,
        })
    }

    pub fn host_exists(&self, hostname: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM hosts WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn select_resolution(start: Option<i64>, end: Option<i64>) -> Resolution {
    let window = match (start, end) {
        (Some(start), Some(end)) => end - start,
        _ => return Resolution::OneHour,
    };

    if window <= RAW_WINDOW_SECS {
        Resolution::Raw
    } else if window <= ONE_MIN_WINDOW_SECS {
        Resolution::OneMinute
    } else {
        Resolution::OneHour
    }
}

fn row_to_sample(row: &rusqlite::Row) -> rusqlite::Result<Sample> {
    Ok(Sample {
        timestamp: row.get(0)?,
        metric_type: row.get(1)?,
        host: row.get(2)?,
        tags: row.get(3)?,
        value: row.get(4)?,
    })
}
