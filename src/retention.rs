//! Retention and rollup scheduling
//! Mission: keep the raw table bounded and the 1m/1h tables populated,
//! off the ingest critical path
//!
//! Runs as standalone Tokio interval tasks with jitter, so a fleet of
//! aggregators restarted together doesn't all sweep at once.

use std::time::Duration;

use rand::Rng;

use crate::store::{Resolution, SampleStore};

pub const RAW_RETENTION_SECS: i64 = 7 * 24 * 3600;
pub const ONE_MIN_RETENTION_SECS: i64 = 30 * 24 * 3600;
pub const ONE_HOUR_RETENTION_SECS: i64 = 365 * 24 * 3600;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const MAX_JITTER_SECS: u64 = 120;

fn jittered(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_SECS);
    base + Duration::from_secs(jitter)
}

/// Runs forever on an hourly-ish jittered cadence, deleting rows past
/// each resolution's retention window and then materializing the 1m/1h
/// rollup tables from raw. Both sweeps share one timer so a fleet of
/// aggregators restarted together settles onto a single jittered phase
/// instead of two independent ones drifting apart.
pub async fn run_retention_loop(store: SampleStore) {
    loop {
        tokio::time::sleep(jittered(SWEEP_INTERVAL)).await;
        sweep_once(&store).await;
        rollup_once(&store).await;
    }
}

async fn sweep_once(store: &SampleStore) {
    for (resolution, retention_secs, label) in [
        (Resolution::Raw, RAW_RETENTION_SECS, "raw"),
        (Resolution::OneMinute, ONE_MIN_RETENTION_SECS, "1m"),
        (Resolution::OneHour, ONE_HOUR_RETENTION_SECS, "1h"),
    ] {
        match store.apply_retention(resolution, retention_secs) {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(resolution = label, deleted, "retention sweep");
                }
            }
            Err(err) => tracing::warn!(resolution = label, error = %err, "retention sweep failed"),
        }
    }
}

async fn rollup_once(store: &SampleStore) {
    match store.run_rollup() {
        Ok((minute_rows, hour_rows)) => {
            tracing::debug!(minute_rows, hour_rows, "rollup downsampler");
        }
        Err(err) => tracing::warn!(error = %err, "rollup downsampler failed"),
    }
}

/// Runs forever, marking hosts past the liveness window inactive.
/// Disabled by default: liveness is otherwise computed implicitly at
/// read time from `last_seen`.
pub async fn run_reaper_loop(hosts: crate::hosts::HostRegistry) {
    loop {
        tokio::time::sleep(jittered(SWEEP_INTERVAL)).await;
        match hosts.reap_inactive() {
            Ok(reaped) => {
                if reaped > 0 {
                    tracing::info!(reaped, "reaper marked hosts inactive");
                }
            }
            Err(err) => tracing::warn!(error = %err, "reaper sweep failed"),
        }
    }
}
