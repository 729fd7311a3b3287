//! Route handlers
//! Mission: translate HTTP requests into store/detector calls and back
//! into the wire JSON shapes external agents and operators expect

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::store::{RangeQuery, Sample};

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_ML_HOST: &str = "localhost";

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
        "version": CRATE_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListHostsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn list_hosts(
    State(state): State<AppState>,
    Query(query): Query<ListHostsQuery>,
) -> AppResult<Json<Value>> {
    let hosts = state.hosts.list(query.include_inactive)?;
    Ok(Json(json!({
        "hosts": hosts,
        "count": hosts.len(),
        "timestamp": Utc::now().timestamp(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub host: Option<String>,
    pub metric_type: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn query_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> AppResult<Json<Value>> {
    let samples = state.store.query_range(RangeQuery {
        host: query.host.as_deref(),
        metric_type: query.metric_type.as_deref(),
        start: query.start,
        end: query.end,
        limit: query.limit,
    })?;

    Ok(Json(json!({
        "metrics": samples,
        "count": samples.len(),
        "timestamp": Utc::now().timestamp(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub host: Option<String>,
}

pub async fn latest_metrics(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> AppResult<Json<Value>> {
    let samples = state.store.latest_per_metric(query.host.as_deref())?;
    Ok(Json(json!({
        "metrics": samples,
        "count": samples.len(),
        "timestamp": Utc::now().timestamp(),
    })))
}

pub async fn fleet_summary(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let summary = state.store.fleet_summary(state.config.liveness_window_secs)?;
    Ok(Json(json!({
        "total_hosts": summary.total_hosts,
        "online_hosts": summary.online_hosts,
        "offline_hosts": summary.offline_hosts,
        "avg_cpu_usage": summary.avg_cpu_usage,
        "total_memory_used": summary.total_memory_used,
        "timestamp": summary.timestamp,
    })))
}

/// Pulls one sample out of a raw JSON element by hand rather than through a
/// typed `Deserialize` struct, so a single malformed row (missing field,
/// wrong JSON type) fails only that row instead of the whole batch.
fn parse_incoming_sample(raw: &Value, hostname: &str, now: i64) -> Option<Sample> {
    let metric_type = raw.get("metric_type")?.as_str()?.to_string();
    let value = raw.get("value")?.as_f64()?;
    let timestamp = raw.get("timestamp").and_then(Value::as_i64).unwrap_or(now);
    let tags = raw.get("tags").and_then(Value::as_str).unwrap_or("").to_string();

    Some(Sample {
        timestamp,
        metric_type,
        host: hostname.to_string(),
        tags,
        value,
    })
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub tags: Option<String>,
    pub metrics: Option<Vec<Value>>,
}

pub async fn ingest_metrics(
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> AppResult<Json<Value>> {
    let hostname = body
        .hostname
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::missing_field("hostname"))?;

    let raw_metrics = body
        .metrics
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::missing_field("metrics"))?;

    state.hosts.register(
        &hostname,
        body.version.as_deref(),
        body.platform.as_deref(),
        body.tags.as_deref(),
    )?;

    let now = Utc::now().timestamp();
    let received = raw_metrics.len();
    let mut samples = Vec::with_capacity(received);
    let mut parse_failed = 0usize;
    for raw in &raw_metrics {
        match parse_incoming_sample(raw, &hostname, now) {
            Some(sample) => samples.push(sample),
            None => parse_failed += 1,
        }
    }

    let result = state.store.write_batch(&hostname, &samples)?;

    Ok(Json(json!({
        "status": "success",
        "hostname": hostname,
        "metrics_received": received,
        "metrics_stored": result.success_count,
        "metrics_failed": result.failed_count + parse_failed,
        "timestamp": now,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub tags: Option<String>,
}

pub async fn register_host(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<Json<Value>> {
    let hostname = body
        .hostname
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::missing_field("hostname"))?;

    state.hosts.register(
        &hostname,
        body.version.as_deref(),
        body.platform.as_deref(),
        body.tags.as_deref(),
    )?;

    Ok(Json(json!({
        "status": "registered",
        "hostname": hostname,
        "timestamp": Utc::now().timestamp(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    pub metric: Option<String>,
    pub host: Option<String>,
    pub hours: Option<i64>,
}

pub async fn ml_train(
    State(state): State<AppState>,
    Json(body): Json<TrainRequest>,
) -> AppResult<Json<Value>> {
    let hours = body.hours.unwrap_or(24);

    if let Some(metric) = body.metric {
        let host = body.host.unwrap_or_else(|| DEFAULT_ML_HOST.to_string());
        state.detectors.train(&host, &metric, hours)?;
        return Ok(Json(json!({
            "status": "success",
            "metric": metric,
            "host": host,
            "hours": hours,
        })));
    }

    let (trained, failed) = state.detectors.train_all(hours)?;
    Ok(Json(json!({
        "status": "success",
        "trained": trained,
        "failed": failed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MetricHostQuery {
    pub metric: Option<String>,
    pub host: Option<String>,
}

pub async fn ml_detect(
    State(state): State<AppState>,
    Query(query): Query<MetricHostQuery>,
) -> AppResult<Json<Value>> {
    let metric = query.metric.ok_or_else(|| AppError::missing_param("metric"))?;
    let host = query.host.unwrap_or_else(|| DEFAULT_ML_HOST.to_string());

    let latest = state
        .store
        .latest_per_metric(Some(&host))?
        .into_iter()
        .find(|s| s.metric_type == metric)
        .ok_or_else(|| AppError::NotFound(format!("No recent value for metric: {metric}")))?;

    let (results, is_anomaly, confidence) = state.detectors.detect(&host, &metric, latest.value)?;

    let methods: HashMap<&str, Value> = results
        .iter()
        .map(|(name, result)| {
            (
                name.as_str(),
                json!({
                    "is_anomaly": result.is_anomaly,
                    "score": result.score,
                    "threshold": result.threshold,
                    "expected_value": result.expected_value,
                }),
            )
        })
        .collect();

    Ok(Json(json!({
        "metric": metric,
        "host": host,
        "timestamp": latest.timestamp,
        "value": latest.value,
        "is_anomaly": is_anomaly,
        "confidence": confidence,
        "methods": methods,
    })))
}

pub async fn ml_baseline(
    State(state): State<AppState>,
    Query(query): Query<MetricHostQuery>,
) -> AppResult<Json<Value>> {
    let metric = query.metric.ok_or_else(|| AppError::missing_param("metric"))?;
    let host = query.host.unwrap_or_else(|| DEFAULT_ML_HOST.to_string());

    let baseline = state
        .baselines
        .get(&metric, &host)?
        .ok_or_else(|| AppError::NotFound("No baseline available for metric".to_string()))?;

    let (lower, upper) = baseline.thresholds(crate::baseline::DEFAULT_THRESHOLD_SIGMA);

    Ok(Json(json!({
        "metric": metric,
        "host": host,
        "baseline": baseline,
        "thresholds": { "lower": lower, "upper": upper },
    })))
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub metric: Option<String>,
    pub host: Option<String>,
    pub horizon: Option<String>,
}

pub async fn ml_predict(
    State(state): State<AppState>,
    Query(query): Query<PredictQuery>,
) -> AppResult<Json<Value>> {
    let metric = query.metric.ok_or_else(|| AppError::missing_param("metric"))?;
    let host = query.host.unwrap_or_else(|| DEFAULT_ML_HOST.to_string());
    let horizon_raw = query.horizon.as_deref().unwrap_or("1h");

    let horizon_hours: i64 = horizon_raw
        .strip_suffix('h')
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| AppError::ClientInput("Invalid horizon format (use: 1h, 2h, etc.)".to_string()))?;

    let predictions = state
        .forecaster
        .predict(&host, &metric, horizon_hours * 3600)?
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::NotFound("Insufficient data for prediction".to_string()))?;

    Ok(Json(json!({
        "metric": metric,
        "host": host,
        "horizon_hours": horizon_hours,
        "predictions": predictions,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn missing_hostname_is_client_input_error() {
        let err = AppError::missing_field("hostname");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_row_is_skipped_without_rejecting_well_formed_rows() {
        let now = 1_000;
        let good = json!({"metric_type": "cpu.usage", "value": 42.0, "timestamp": now});
        let missing_value = json!({"metric_type": "cpu.usage"});
        let wrong_type = json!({"metric_type": "cpu.usage", "value": "not-a-number"});

        assert!(parse_incoming_sample(&good, "web-01", now).is_some());
        assert!(parse_incoming_sample(&missing_value, "web-01", now).is_none());
        assert!(parse_incoming_sample(&wrong_type, "web-01", now).is_none());
    }
}
