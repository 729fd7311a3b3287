//! End-to-end HTTP surface tests, exercised through the Axum router
//! directly (no real socket) via `tower::ServiceExt::oneshot`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sysmon_aggregator::api::{build_router, AppState};
use sysmon_aggregator::auth::TokenAuthenticator;
use sysmon_aggregator::baseline::BaselineStore;
use sysmon_aggregator::detectors::DetectorRegistry;
use sysmon_aggregator::discovery::MdnsStub;
use sysmon_aggregator::forecast::Forecaster;
use sysmon_aggregator::hosts::HostRegistry;
use sysmon_aggregator::middleware::{RateLimitConfig, RateLimitLayer};
use sysmon_aggregator::store::SampleStore;
use tower::ServiceExt;

const TOKEN: &str = "test-token";

fn peer_addr() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

fn test_state() -> AppState {
    let file = tempfile::NamedTempFile::new().unwrap();
    let store = SampleStore::new(file.path().to_str().unwrap()).unwrap();
    std::mem::forget(file);

    let hosts = HostRegistry::new(&store, 300);
    let baselines = BaselineStore::new(store.clone(), 24 * 3600);
    let detectors = DetectorRegistry::new(store.clone(), baselines.clone());
    let forecaster = Forecaster::new(store.clone());

    AppState {
        store,
        hosts,
        baselines,
        detectors,
        forecaster,
        config: Arc::new(sysmon_aggregator::config::Config {
            host: "127.0.0.1".into(),
            port: 9000,
            db_path: "unused".into(),
            tls: None,
            mdns: false,
            mdns_hostname: None,
            reap_inactive: false,
            token: TOKEN.into(),
            liveness_window_secs: 300,
            baseline_freshness_secs: 24 * 3600,
        }),
        token_authenticator: TokenAuthenticator::new(TOKEN),
        rate_limiter: RateLimitLayer::new(RateLimitConfig::default()),
        advertiser: Arc::new(MdnsStub),
        discoverer: Arc::new(MdnsStub),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Requests never traverse a real socket in these tests, so the rate
/// limiter's `ConnectInfo` extractor is satisfied by hand.
fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri).extension(ConnectInfo(peer_addr()))
}

fn authed_request(method: &str, uri: &str) -> axum::http::request::Builder {
    request(method, uri).header("x-sysmon-token", TOKEN)
}

#[tokio::test]
async fn health_requires_no_auth() {
    let router = build_router(test_state());
    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn non_health_endpoint_without_token_is_unauthorized() {
    let router = build_router(test_state());
    let response = router
        .oneshot(request("GET", "/api/hosts").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ingest_then_read_returns_all_samples_descending() {
    let router = build_router(test_state());

    let body = json!({
        "hostname": "web-01",
        "metrics": [
            {"metric_type": "cpu.usage", "value": 10.0, "timestamp": 1000},
            {"metric_type": "cpu.usage", "value": 20.0, "timestamp": 1001},
            {"metric_type": "cpu.usage", "value": 30.0, "timestamp": 1002},
        ]
    });

    let response = router
        .clone()
        .oneshot(
            authed_request("POST", "/api/metrics")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let parsed = body_json(response).await;
    assert_eq!(parsed["metrics_stored"], 3);
    assert_eq!(parsed["metrics_failed"], 0);

    let response = router
        .oneshot(authed_request("GET", "/api/metrics?host=web-01").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let parsed = body_json(response).await;
    let metrics = parsed["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 3);
    assert_eq!(metrics[0]["timestamp"], 1002);
}

#[tokio::test]
async fn missing_metrics_field_is_bad_request() {
    let router = build_router(test_state());
    let body = json!({ "hostname": "web-01", "metrics": [] });

    let response = router
        .oneshot(
            authed_request("POST", "/api/metrics")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let parsed = body_json(response).await;
    assert_eq!(parsed["error"], "Missing required field: metrics");
}

#[tokio::test]
async fn register_heartbeat_then_list_hosts_round_trip() {
    let router = build_router(test_state());

    let body = json!({ "hostname": "web-01" });
    let response = router
        .clone()
        .oneshot(
            authed_request("POST", "/api/register")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(authed_request("GET", "/api/hosts").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let parsed = body_json(response).await;
    assert_eq!(parsed["count"], 1);
}

#[tokio::test]
async fn ml_detect_without_metric_param_is_bad_request() {
    let router = build_router(test_state());
    let response = router
        .oneshot(authed_request("GET", "/api/ml/detect").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ml_baseline_with_no_data_is_not_found() {
    let router = build_router(test_state());
    let response = router
        .oneshot(
            authed_request("GET", "/api/ml/baseline?metric=cpu.usage&host=web-01")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_writers_converge_on_max_last_seen() {
    let router = build_router(test_state());

    let mut handles = Vec::new();
    for i in 0..20 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            let body = json!({
                "hostname": "web-01",
                "metrics": (0..10).map(|j| json!({
                    "metric_type": "cpu.usage",
                    "value": (i * 10 + j) as f64,
                    "timestamp": 1_000_000 + i * 10 + j,
                })).collect::<Vec<_>>(),
            });
            router
                .oneshot(
                    authed_request("POST", "/api/metrics")
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(authed_request("GET", "/api/hosts?include_inactive=true").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let parsed = body_json(response).await;
    assert_eq!(parsed["count"], 1);
}
