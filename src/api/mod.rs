//! Ingest/query API
//! Mission: the HTTP surface agents and operators talk to
//!
//! Route groups are built separately, merged, then cross-cutting
//! middleware is layered once over the merged router.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenAuthenticator;
use crate::baseline::BaselineStore;
use crate::config::Config;
use crate::detectors::DetectorRegistry;
use crate::discovery::{Advertiser, Discoverer};
use crate::forecast::Forecaster;
use crate::hosts::HostRegistry;
use crate::middleware::{rate_limit_middleware, RateLimitLayer};
use crate::store::SampleStore;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: SampleStore,
    pub hosts: HostRegistry,
    pub baselines: BaselineStore,
    pub detectors: DetectorRegistry,
    pub forecaster: Forecaster,
    pub config: Arc<Config>,
    pub token_authenticator: TokenAuthenticator,
    pub rate_limiter: RateLimitLayer,
    pub advertiser: Arc<dyn Advertiser>,
    pub discoverer: Arc<dyn Discoverer>,
}

impl FromRef<AppState> for TokenAuthenticator {
    fn from_ref(state: &AppState) -> Self {
        state.token_authenticator.clone()
    }
}

impl FromRef<AppState> for RateLimitLayer {
    fn from_ref(state: &AppState) -> Self {
        state.rate_limiter.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/api/hosts", get(handlers::list_hosts))
        .route("/api/metrics", get(handlers::query_metrics).post(handlers::ingest_metrics))
        .route("/api/latest", get(handlers::latest_metrics))
        .route("/api/fleet/summary", get(handlers::fleet_summary))
        .route("/api/register", post(handlers::register_host))
        .route("/api/ml/train", post(handlers::ml_train))
        .route("/api/ml/detect", get(handlers::ml_detect))
        .route("/api/ml/baseline", get(handlers::ml_baseline))
        .route("/api/ml/predict", get(handlers::ml_predict))
        .layer(axum::middleware::from_fn_with_state(
            state.token_authenticator.clone(),
            crate::auth::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-sysmon-token"),
        ]);

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(crate::middleware::request_logging_simple))
        .layer(TimeoutLayer::new(DEFAULT_REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}
