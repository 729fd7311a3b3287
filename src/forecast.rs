//! Forecaster
//! Mission: project a metric forward by fitting a line through its
//! recent history
//!
//! Linear least-squares fit over the last 24h of raw samples, stepped
//! forward by the median inter-sample interval.

use chrono::Utc;

use crate::error::AppResult;
use crate::store::{RangeQuery, SampleStore};

const FORECAST_WINDOW_SECS: i64 = 24 * 3600;
const MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Prediction {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Clone)]
pub struct Forecaster {
    store: SampleStore,
}

impl Forecaster {
    pub fn new(store: SampleStore) -> Self {
        Forecaster { store }
    }

    /// Predictions spaced by the median inter-sample interval, out to
    /// `horizon_secs`. `None` if fewer than 10 samples are available in
    /// the trailing 24h window, regardless of the requested horizon.
    pub fn predict(&self, host: &str, metric_type: &str, horizon_secs: i64) -> AppResult<Option<Vec<Prediction>>> {
        let now = Utc::now().timestamp();
        let mut samples = self.store.query_range(RangeQuery {
            host: Some(host),
            metric_type: Some(metric_type),
            start: Some(now - FORECAST_WINDOW_SECS),
            end: Some(now),
            limit: Some(i64::MAX),
        })?;

        if samples.len() < MIN_SAMPLES {
            return Ok(None);
        }

        samples.sort_by_key(|s| s.timestamp);

        let timestamps: Vec<f64> = samples.iter().map(|s| s.timestamp as f64).collect();
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let (slope, intercept) = least_squares(&timestamps, &values);

        let interval = median_interval(&samples.iter().map(|s| s.timestamp).collect::<Vec<_>>());
        if interval <= 0 {
            return Ok(None);
        }

        let last_ts = samples.last().unwrap().timestamp;
        let steps = horizon_secs / interval;

        let predictions = (1..=steps)
            .map(|i| {
                let ts = last_ts + i * interval;
                Prediction {
                    timestamp: ts,
                    value: slope * ts as f64 + intercept,
                }
            })
            .collect();

        Ok(Some(predictions))
    }
}

fn least_squares(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return (0.0, sum_y / n);
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}

fn median_interval(timestamps: &[i64]) -> i64 {
    if timestamps.len() < 2 {
        return 0;
    }
    let mut diffs: Vec<i64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    diffs.sort();
    diffs[diffs.len() / 2]
}
