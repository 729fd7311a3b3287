//! Runtime configuration
//! Mission: One CLI/env surface, no implicit module-level singletons

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

const DEFAULT_PORT: u16 = 9000;
const LIVENESS_WINDOW_SECS: i64 = 300;
const BASELINE_FRESHNESS_SECS: i64 = 24 * 3600;

#[derive(Parser, Debug)]
#[command(name = "sysmon-aggregator")]
#[command(about = "Fleet-wide metrics aggregator: ingest, storage, anomaly detection")]
pub struct Args {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path to the SQLite database file
    #[arg(default_value = "~/.sysmon/aggregator.db")]
    pub db_path: String,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Serve over TLS using --cert/--key
    #[arg(long)]
    pub tls: bool,

    /// Path to TLS certificate (PEM)
    #[arg(long)]
    pub cert: Option<String>,

    /// Path to TLS private key (PEM)
    #[arg(long)]
    pub key: Option<String>,

    /// Advertise this aggregator via mDNS
    #[arg(long)]
    pub mdns: bool,

    /// Hostname to advertise under mDNS (defaults to machine hostname)
    #[arg(long)]
    pub mdns_hostname: Option<String>,

    /// Reap hosts past the liveness window by marking them inactive
    #[arg(long)]
    pub reap_inactive: bool,

    /// Pre-shared ingest token. Falls back to SYSMON_AGGREGATOR_TOKEN.
    #[arg(long, env = "SYSMON_AGGREGATOR_TOKEN")]
    pub token: Option<String>,
}

/// Fully resolved configuration handed to `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub tls: Option<TlsConfig>,
    pub mdns: bool,
    pub mdns_hostname: Option<String>,
    pub reap_inactive: bool,
    pub token: String,
    pub liveness_window_secs: i64,
    pub baseline_freshness_secs: i64,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        let token = args
            .token
            .filter(|t| !t.trim().is_empty())
            .context(
                "No authentication token configured. Set SYSMON_AGGREGATOR_TOKEN or pass --token.",
            )?;

        let tls = if args.tls {
            let cert_path = args
                .cert
                .context("--tls requires --cert <path>")?;
            let key_path = args.key.context("--tls requires --key <path>")?;
            Some(TlsConfig { cert_path, key_path })
        } else {
            if args.cert.is_some() || args.key.is_some() {
                bail!("--cert/--key were given but --tls was not");
            }
            None
        };

        Ok(Config {
            host: args.host,
            port: args.port,
            db_path: resolve_db_path(&args.db_path),
            tls,
            mdns: args.mdns,
            mdns_hostname: args.mdns_hostname,
            reap_inactive: args.reap_inactive,
            token,
            liveness_window_secs: LIVENESS_WINDOW_SECS,
            baseline_freshness_secs: BASELINE_FRESHNESS_SECS,
        })
    }
}

/// Expand a leading `~` and ensure the parent directory exists.
pub fn resolve_db_path(raw: &str) -> String {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        dirs_home().join(rest)
    } else {
        PathBuf::from(raw)
    };

    if let Some(parent) = expanded.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    expanded.to_string_lossy().to_string()
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load a `.env` file from the current directory or the manifest directory.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sysmon_aggregator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
