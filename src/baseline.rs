//! Baseline store
//! Mission: learn per-(host, metric) normal ranges from raw history

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;
use crate::store::{RangeQuery, SampleStore};

const MIN_SAMPLES_TO_LEARN: usize = 10;
const DEFAULT_SIGMA: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub metric_type: String,
    pub host: String,
    pub mean: f64,
    pub stddev: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub percentile_95: f64,
    pub percentile_99: f64,
    pub sample_count: i64,
    pub last_updated: i64,
}

impl Baseline {
    pub fn is_fresh(&self, now: i64, freshness_secs: i64) -> bool {
        now - self.last_updated <= freshness_secs
    }

    /// `(lower, upper)` bounds at `sigma` standard deviations from the mean.
    pub fn thresholds(&self, sigma: f64) -> (f64, f64) {
        (self.mean - sigma * self.stddev, self.mean + sigma * self.stddev)
    }
}

#[derive(Debug)]
pub enum BaselineOutcome {
    Learned(Baseline),
    InsufficientData,
}

#[derive(Clone)]
pub struct BaselineStore {
    conn: Arc<Mutex<Connection>>,
    store: SampleStore,
    freshness_secs: i64,
}

impl BaselineStore {
    pub fn new(store: SampleStore, freshness_secs: i64) -> Self {
        let conn = store.shared_connection();
        BaselineStore {
            conn,
            store,
            freshness_secs,
        }
    }

    /// Learn a baseline from the last `hours` of raw samples. Requires at
    /// least 10 samples; anything less is `InsufficientData`, not an error.
    pub fn learn(&self, metric_type: &str, host: &str, hours: i64) -> AppResult<BaselineOutcome> {
        let now = Utc::now().timestamp();
        let start = now - hours * 3600;

        let samples = self.store.query_range(RangeQuery {
            host: Some(host),
            metric_type: Some(metric_type),
            start: Some(start),
            end: Some(now),
            limit: Some(i64::MAX),
        })?;

        if samples.len() < MIN_SAMPLES_TO_LEARN {
            return Ok(BaselineOutcome::InsufficientData);
        }

        let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let stddev = variance.sqrt();

        let baseline = Baseline {
            metric_type: metric_type.to_string(),
            host: host.to_string(),
            mean,
            stddev,
            min_value: values[0],
            max_value: values[values.len() - 1],
            percentile_95: percentile(&values, 95.0),
            percentile_99: percentile(&values, 99.0),
            sample_count: values.len() as i64,
            last_updated: now,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO baselines
             (metric_type, host, mean, stddev, min_value, max_value, percentile_95, percentile_99, sample_count, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                baseline.metric_type,
                baseline.host,
                baseline.mean,
                baseline.stddev,
                baseline.min_value,
                baseline.max_value,
                baseline.percentile_95,
                baseline.percentile_99,
                baseline.sample_count,
                baseline.last_updated,
            ],
        )?;

        Ok(BaselineOutcome::Learned(baseline))
    }

    /// Returns a fresh baseline if one is cached, transparently relearning
    /// over the same 24h window when stale or absent. `None` if relearning
    /// also yields insufficient data.
    pub fn get(&self, metric_type: &str, host: &str) -> AppResult<Option<Baseline>> {
        let now = Utc::now().timestamp();

        if let Some(cached) = self.fetch_cached(metric_type, host)? {
            if cached.is_fresh(now, self.freshness_secs) {
                return Ok(Some(cached));
            }
        }

        match self.learn(metric_type, host, self.freshness_secs / 3600)? {
            BaselineOutcome::Learned(baseline) => Ok(Some(baseline)),
            BaselineOutcome::InsufficientData => Ok(None),
        }
    }

    pub fn is_anomalous(&self, metric_type: &str, host: &str, value: f64, sigma: f64) -> AppResult<Option<bool>> {
        let Some(baseline) = self.get(metric_type, host)? else {
            return Ok(None);
        };
        if baseline.stddev < 1e-6 {
            return Ok(Some(false));
        }
        let (lower, upper) = baseline.thresholds(sigma);
        Ok(Some(value < lower || value > upper))
    }

    fn fetch_cached(&self, metric_type: &str, host: &str) -> AppResult<Option<Baseline>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT metric_type, host, mean, stddev, min_value, max_value, percentile_95, percentile_99, sample_count, last_updated
                 FROM baselines WHERE metric_type = ?1 AND host = ?2",
                params![metric_type, host],
                row_to_baseline,
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_baseline(row: &rusqlite::Row) -> rusqlite::Result<Baseline> {
    Ok(Baseline {
        metric_type: row.get(0)?,
        host: row.get(1)?,
        mean: row.get(2)?,
        stddev: row.get(3)?,
        min_value: row.get(4)?,
        max_value: row.get(5)?,
        percentile_95: row.get(6)?,
        percentile_99: row.get(7)?,
        sample_count: row.get(8)?,
        last_updated: row.get(9)?,
    })
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

pub const DEFAULT_THRESHOLD_SIGMA: f64 = DEFAULT_SIGMA;
