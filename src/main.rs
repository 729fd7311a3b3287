//! sysmon-aggregator binary
//!
//! Wires the storage, detection, and API layers together, starts the
//! background retention/rollup tasks, and serves HTTP (optionally TLS)
//! until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use sysmon_aggregator::api::{build_router, AppState};
use sysmon_aggregator::auth::TokenAuthenticator;
use sysmon_aggregator::baseline::BaselineStore;
use sysmon_aggregator::config::{init_tracing, load_env, Args, Config};
use sysmon_aggregator::detectors::DetectorRegistry;
use sysmon_aggregator::discovery::{Advertiser, Discoverer, MdnsStub, ServiceMetadata};
use sysmon_aggregator::forecast::Forecaster;
use sysmon_aggregator::hosts::HostRegistry;
use sysmon_aggregator::middleware::{RateLimitConfig, RateLimitLayer};
use sysmon_aggregator::retention::{run_reaper_loop, run_retention_loop};
use sysmon_aggregator::store::SampleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("sysmon-aggregator: {err:#}");
            std::process::exit(1);
        }
    };

    let store = SampleStore::new(&config.db_path)?;
    let hosts = HostRegistry::new(&store, config.liveness_window_secs);
    let baselines = BaselineStore::new(store.clone(), config.baseline_freshness_secs);
    let detectors = DetectorRegistry::new(store.clone(), baselines.clone());
    let forecaster = Forecaster::new(store.clone());
    let token_authenticator = TokenAuthenticator::new(config.token.clone());
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    let advertiser: Arc<dyn Advertiser> = Arc::new(MdnsStub);
    let discoverer: Arc<dyn Discoverer> = Arc::new(MdnsStub);

    let state = AppState {
        store: store.clone(),
        hosts: hosts.clone(),
        baselines,
        detectors,
        forecaster,
        config: Arc::new(config.clone()),
        token_authenticator,
        rate_limiter: rate_limiter.clone(),
        advertiser: advertiser.clone(),
        discoverer,
    };

    tokio::spawn(run_retention_loop(store.clone()));
    if config.reap_inactive {
        tokio::spawn(run_reaper_loop(hosts.clone()));
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.cleanup();
        }
    });

    if config.mdns {
        let hostname = config.mdns_hostname.clone().unwrap_or_else(|| "localhost".to_string());
        let metadata = ServiceMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: if config.tls.is_some() { "https".into() } else { "http".into() },
            region: None,
        };
        advertiser.start(config.port, &hostname, metadata).await?;
    }

    let router = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(%addr, tls = config.tls.is_some(), "starting sysmon-aggregator");

    let tls_config = config.tls.clone();
    let serve = async move {
        if let Some(tls) = tls_config {
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await?;
            axum_server::bind_rustls(addr, rustls_config)
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        } else {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await
        }
    };

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server exited with error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            if config.mdns {
                let _ = advertiser.stop().await;
            }
        }
    }

    Ok(())
}
