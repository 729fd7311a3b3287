//! Anomaly detectors
//! Mission: flag out-of-range samples via independent statistical methods
//! and combine them into one consensus verdict
//!
//! The trained outlier detector is a hand-rolled randomized-split scorer,
//! since no sklearn-equivalent crate exists in this stack.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::baseline::{BaselineStore, DEFAULT_THRESHOLD_SIGMA};
use crate::error::AppResult;
use crate::store::{RangeQuery, SampleStore};

const STATISTICAL_WINDOW: usize = 100;
const STATISTICAL_MIN_HISTORY: usize = 10;
const Z_THRESHOLD: f64 = 3.0;
const TRAINED_MIN_SAMPLES: usize = 50;
const LAGGED_FEATURES: usize = 5;
const CONTAMINATION: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub score: f64,
    pub threshold: f64,
    pub value: f64,
    pub expected_value: Option<f64>,
    pub confidence: Option<f64>,
}

/// An online incremental detector keyed to a single (host, metric). Keeps a
/// bounded window of recent values and recomputes mean/stddev on each
/// update; O(window) per sample.
pub struct OnlineStatisticalDetector {
    window: VecDeque<f64>,
    window_size: usize,
    z_threshold: f64,
}

impl OnlineStatisticalDetector {
    pub fn new(window_size: usize) -> Self {
        OnlineStatisticalDetector {
            window: VecDeque::with_capacity(window_size),
            window_size,
            z_threshold: Z_THRESHOLD,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.window.push_back(value);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
    }

    /// Folds `value` into the window before scoring it, so the detector
    /// keeps sliding on every call instead of only during training.
    pub fn detect(&mut self, value: f64) -> AnomalyResult {
        self.update(value);

        if self.window.len() < STATISTICAL_MIN_HISTORY {
            return AnomalyResult {
                is_anomaly: false,
                score: 0.0,
                threshold: self.z_threshold,
                value,
                expected_value: None,
                confidence: None,
            };
        }

        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let variance =
            self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.window.len() as f64;
        let stddev = variance.sqrt();

        if stddev < 1e-6 {
            return AnomalyResult {
                is_anomaly: false,
                score: 0.0,
                threshold: self.z_threshold,
                value,
                expected_value: Some(mean),
                confidence: None,
            };
        }

        let z_score = ((value - mean) / stddev).abs();
        AnomalyResult {
            is_anomaly: z_score > self.z_threshold,
            score: z_score,
            threshold: self.z_threshold,
            value,
            expected_value: Some(mean),
            confidence: Some(1.0 - (1.0 / (1.0 + z_score))),
        }
    }
}

/// Sliding-window feature vector: current value, up to `LAGGED_FEATURES`
/// lagged values (zero-padded), then mean/stddev/min/max over the recent
/// window.
fn build_features(values: &[f64], index: usize) -> Vec<f64> {
    let mut features = vec![values[index]];

    for lag in 1..=LAGGED_FEATURES {
        let lagged = if index >= lag { values[index - lag] } else { 0.0 };
        features.push(lagged);
    }

    let start = index.saturating_sub(LAGGED_FEATURES);
    let recent = &values[start..=index];
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let stddev = if recent.len() > 1 {
        (recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / recent.len() as f64).sqrt()
    } else {
        0.0
    };
    let min = recent.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    features.push(mean);
    features.push(stddev);
    features.push(min);
    features.push(max);
    features
}

/// Isolation-forest-style trained outlier detector. Scores each sample by
/// how quickly a set of randomized axis-aligned splits isolate it;
/// consistently-shallow isolation depth means an outlier.
#[cfg(feature = "ml-detector")]
pub struct TrainedOutlierDetector {
    trees: Vec<RandomSplitTree>,
    feature_means: Vec<f64>,
    feature_stddevs: Vec<f64>,
    trained: bool,
}

#[cfg(feature = "ml-detector")]
struct RandomSplitTree {
    split_feature: usize,
    split_value: f64,
    left: Option<Box<RandomSplitTree>>,
    right: Option<Box<RandomSplitTree>>,
    depth: u32,
}

#[cfg(feature = "ml-detector")]
impl TrainedOutlierDetector {
    const N_TREES: usize = 50;
    const MAX_DEPTH: u32 = 8;

    pub fn train(values: &[f64]) -> Option<Self> {
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;

        if values.len() < TRAINED_MIN_SAMPLES {
            return None;
        }

        let feature_rows: Vec<Vec<f64>> = (0..values.len())
            .map(|i| build_features(values, i))
            .collect();
        let n_features = feature_rows[0].len();

        let mut feature_means = vec![0.0; n_features];
        let mut feature_stddevs = vec![1.0; n_features];
        for f in 0..n_features {
            let col: Vec<f64> = feature_rows.iter().map(|r| r[f]).collect();
            let mean = col.iter().sum::<f64>() / col.len() as f64;
            let stddev = (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / col.len() as f64).sqrt();
            feature_means[f] = mean;
            feature_stddevs[f] = if stddev < 1e-9 { 1.0 } else { stddev };
        }

        let scaled: Vec<Vec<f64>> = feature_rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(f, v)| (v - feature_means[f]) / feature_stddevs[f])
                    .collect()
            })
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let trees = (0..Self::N_TREES)
            .map(|_| RandomSplitTree::build(&scaled, 0, Self::MAX_DEPTH, &mut rng))
            .collect();

        Some(TrainedOutlierDetector {
            trees,
            feature_means,
            feature_stddevs,
            trained: true,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn detect(&self, values: &[f64], index: usize) -> AnomalyResult {
        let raw = build_features(values, index);
        let scaled: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(f, v)| (v - self.feature_means[f]) / self.feature_stddevs[f])
            .collect();

        let avg_depth = self.trees.iter().map(|t| t.path_length(&scaled) as f64).sum::<f64>()
            / self.trees.len() as f64;

        // Shorter average path length => more anomalous. Negate so higher
        // score means more anomalous, matching the other detectors.
        let score = Self::MAX_DEPTH as f64 - avg_depth;
        let threshold = Self::MAX_DEPTH as f64 * CONTAMINATION;

        AnomalyResult {
            is_anomaly: score > threshold,
            score,
            threshold,
            value: values[index],
            expected_value: None,
            confidence: None,
        }
    }
}

#[cfg(feature = "ml-detector")]
impl RandomSplitTree {
    fn build(rows: &[Vec<f64>], depth: u32, max_depth: u32, rng: &mut impl rand::Rng) -> Self {
        use rand::Rng;

        let n_features = rows.first().map(|r| r.len()).unwrap_or(1);
        let split_feature = rng.gen_range(0..n_features);

        let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r[split_feature]), hi.max(r[split_feature]))
        });
        let split_value = if min.is_finite() && max.is_finite() && max > min {
            rng.gen_range(min..max)
        } else {
            0.0
        };

        if depth >= max_depth || rows.len() <= 1 {
            return RandomSplitTree {
                split_feature,
                split_value,
                left: None,
                right: None,
                depth,
            };
        }

        let (left_rows, right_rows): (Vec<_>, Vec<_>) =
            rows.iter().cloned().partition(|r| r[split_feature] < split_value);

        if left_rows.is_empty() || right_rows.is_empty() {
            return RandomSplitTree {
                split_feature,
                split_value,
                left: None,
                right: None,
                depth,
            };
        }

        RandomSplitTree {
            split_feature,
            split_value,
            left: Some(Box::new(Self::build(&left_rows, depth + 1, max_depth, rng))),
            right: Some(Box::new(Self::build(&right_rows, depth + 1, max_depth, rng))),
            depth,
        }
    }

    fn path_length(&self, row: &[f64]) -> u32 {
        match (row[self.split_feature] < self.split_value, &self.left, &self.right) {
            (true, Some(left), _) => left.path_length(row),
            (false, _, Some(right)) => right.path_length(row),
            _ => self.depth,
        }
    }
}

/// Majority vote across whichever detectors produced a result. Ties do not
/// count as anomalous.
pub fn consensus(results: &HashMap<String, AnomalyResult>) -> (bool, f64) {
    let total = results.len();
    if total == 0 {
        return (false, 0.0);
    }
    let anomaly_votes = results.values().filter(|r| r.is_anomaly).count();
    (anomaly_votes * 2 > total, anomaly_votes as f64 / total as f64)
}

/// In-memory registry of per-(host, metric) detector state, guarded by a
/// per-key lock so a long training run for one pair never blocks
/// detection for another.
#[derive(Clone)]
pub struct DetectorRegistry {
    store: SampleStore,
    baseline_store: BaselineStore,
    online: Arc<Mutex<HashMap<String, OnlineStatisticalDetector>>>,
    #[cfg(feature = "ml-detector")]
    trained: Arc<Mutex<HashMap<String, Option<TrainedOutlierDetector>>>>,
}

fn key(host: &str, metric_type: &str) -> String {
    format!("{host}:{metric_type}")
}

impl DetectorRegistry {
    pub fn new(store: SampleStore, baseline_store: BaselineStore) -> Self {
        DetectorRegistry {
            store,
            baseline_store,
            online: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(feature = "ml-detector")]
            trained: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_ml_available(&self) -> bool {
        cfg!(feature = "ml-detector")
    }

    /// Explicit training entry point, also used lazily by `detect` on
    /// first contact with a (host, metric) pair.
    pub fn train(&self, host: &str, metric_type: &str, hours: i64) -> AppResult<()> {
        let now = Utc::now().timestamp();
        let samples = self.store.query_range(RangeQuery {
            host: Some(host),
            metric_type: Some(metric_type),
            start: Some(now - hours * 3600),
            end: Some(now),
            limit: Some(i64::MAX),
        })?;
        let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        values.reverse(); // query_range returns DESC; detectors want chronological order

        let detector_key = key(host, metric_type);

        {
            let mut online = self.online.lock();
            let mut detector =
                OnlineStatisticalDetector::new(STATISTICAL_WINDOW.min(values.len().max(1)));
            for v in &values {
                detector.update(*v);
            }
            online.insert(detector_key.clone(), detector);
        }

        #[cfg(feature = "ml-detector")]
        {
            let mut trained = self.trained.lock();
            trained.insert(detector_key, TrainedOutlierDetector::train(&values));
        }

        Ok(())
    }

    pub fn train_all(&self, hours: i64) -> AppResult<(usize, usize)> {
        let pairs = self.distinct_host_metric_pairs()?;
        let mut trained = 0;
        let mut failed = 0;
        for (host, metric_type) in pairs {
            match self.train(&host, &metric_type, hours) {
                Ok(()) => trained += 1,
                Err(_) => failed += 1,
            }
        }
        Ok((trained, failed))
    }

    fn distinct_host_metric_pairs(&self) -> AppResult<Vec<(String, String)>> {
        let rows = self.store.latest_per_metric(None)?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let pair = (row.host.clone(), row.metric_type.clone());
            if seen.insert(pair.clone()) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    /// Runs every enabled detector plus the baseline adapter, lazily
    /// training on first contact, and returns both the per-method results
    /// and the consensus verdict.
    pub fn detect(&self, host: &str, metric_type: &str, value: f64) -> AppResult<(HashMap<String, AnomalyResult>, bool, f64)> {
        let detector_key = key(host, metric_type);

        let needs_training = !self.online.lock().contains_key(&detector_key);
        if needs_training {
            self.train(host, metric_type, 24)?;
        }

        let mut results = HashMap::new();

        {
            let mut online = self.online.lock();
            if let Some(detector) = online.get_mut(&detector_key) {
                results.insert("statistical".to_string(), detector.detect(value));
            }
        }

        #[cfg(feature = "ml-detector")]
        {
            let trained = self.trained.lock();
            if let Some(Some(detector)) = trained.get(&detector_key) {
                let now = Utc::now().timestamp();
                let samples = self.store.query_range(RangeQuery {
                    host: Some(host),
                    metric_type: Some(metric_type),
                    start: Some(now - 24 * 3600),
                    end: Some(now),
                    limit: Some(i64::MAX),
                })?;
                let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
                values.reverse();
                values.push(value);
                let last = values.len() - 1;
                if detector.is_trained() {
                    results.insert("trained".to_string(), detector.detect(&values, last));
                }
            }
        }

        if let Some(is_anomalous) = self.baseline_store.is_anomalous(metric_type, host, value, DEFAULT_THRESHOLD_SIGMA)? {
            if let Some(baseline) = self.baseline_store.get(metric_type, host)? {
                let score = if baseline.stddev > 0.0 {
                    ((value - baseline.mean) / baseline.stddev).abs()
                } else {
                    0.0
                };
                results.insert(
                    "baseline".to_string(),
                    AnomalyResult {
                        is_anomaly: is_anomalous,
                        score,
                        threshold: DEFAULT_THRESHOLD_SIGMA,
                        value,
                        expected_value: Some(baseline.mean),
                        confidence: None,
                    },
                );
            }
        }

        let (is_anomaly, confidence) = consensus(&results);
        Ok((results, is_anomaly, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_with_no_anomaly_below_min_history() {
        let mut detector = OnlineStatisticalDetector::new(STATISTICAL_WINDOW);
        let result = detector.detect(1000.0);
        assert!(!result.is_anomaly);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn flags_large_deviation_as_anomaly() {
        let mut detector = OnlineStatisticalDetector::new(STATISTICAL_WINDOW);
        for _ in 0..50 {
            detector.update(50.0);
        }
        let result = detector.detect(5000.0);
        assert!(result.is_anomaly);
    }

    #[test]
    fn zero_stddev_window_scores_zero() {
        let mut detector = OnlineStatisticalDetector::new(STATISTICAL_WINDOW);
        for _ in 0..20 {
            detector.update(10.0);
        }
        let result = detector.detect(10.0);
        assert!(!result.is_anomaly);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn detect_folds_value_into_window_without_explicit_update() {
        let mut detector = OnlineStatisticalDetector::new(STATISTICAL_WINDOW);
        for _ in 0..20 {
            detector.detect(50.0);
        }
        // Window now holds only `detect`-fed values; a fresh deviation
        // should register against them even though `update` was never
        // called directly.
        let result = detector.detect(5000.0);
        assert!(result.is_anomaly);
    }

    #[test]
    fn consensus_is_strict_majority_ties_are_not_anomalous() {
        let mut results = HashMap::new();
        results.insert(
            "a".to_string(),
            AnomalyResult {
                is_anomaly: true,
                score: 5.0,
                threshold: 3.0,
                value: 1.0,
                expected_value: None,
                confidence: None,
            },
        );
        results.insert(
            "b".to_string(),
            AnomalyResult {
                is_anomaly: false,
                score: 0.1,
                threshold: 3.0,
                value: 1.0,
                expected_value: None,
                confidence: None,
            },
        );
        let (is_anomaly, confidence) = consensus(&results);
        assert!(!is_anomaly);
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn consensus_with_no_results_is_not_anomalous() {
        let results = HashMap::new();
        let (is_anomaly, confidence) = consensus(&results);
        assert!(!is_anomaly);
        assert_eq!(confidence, 0.0);
    }
}
