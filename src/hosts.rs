//! Host registry
//! Mission: track which agents are live and since when

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::AppResult;
use crate::store::SampleStore;

#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub hostname: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub tags: String,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub status: String,
}

impl Host {
    pub fn is_active(&self, now: i64, liveness_window_secs: i64) -> bool {
        now - self.last_seen <= liveness_window_secs
    }
}

#[derive(Clone)]
pub struct HostRegistry {
    conn: Arc<Mutex<Connection>>,
    liveness_window_secs: i64,
}

impl HostRegistry {
    /// Shares the sample store's connection: hosts and samples live in the
    /// same database file and must be updated inside the same transactions
    /// where ingest requires it.
    pub fn new(store: &SampleStore, liveness_window_secs: i64) -> Self {
        HostRegistry {
            conn: store.shared_connection(),
            liveness_window_secs,
        }
    }

    /// Upsert semantics: insert on first contact, otherwise refresh
    /// `last_seen` and force `status` back to active. `tags` is written
    /// verbatim on every call, defaulting to empty when not supplied.
    pub fn register(
        &self,
        hostname: &str,
        version: Option<&str>,
        platform: Option<&str>,
        tags: Option<&str>,
    ) -> AppResult<Host> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();

        conn.execute(
            "INSERT INTO hosts (hostname, first_seen, last_seen, tags, version, platform, status)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, 'active')
             ON CONFLICT(hostname) DO UPDATE SET
                last_seen = MAX(hosts.last_seen, excluded.last_seen),
                tags = excluded.tags,
                version = COALESCE(excluded.version, hosts.version),
                platform = COALESCE(excluded.platform, hosts.platform),
                status = 'active'",
            params![hostname, now, tags.unwrap_or(""), version, platform],
        )?;

        self.fetch(&conn, hostname)
    }

    /// No-op if the host is unknown, mirroring the upstream heartbeat
    /// contract: heartbeats never create hosts.
    pub fn heartbeat(&self, hostname: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE hosts SET last_seen = MAX(last_seen, ?1), status = 'active' WHERE hostname = ?2",
            params![now, hostname],
        )?;
        Ok(updated > 0)
    }

    pub fn list(&self, include_inactive: bool) -> AppResult<Vec<Host>> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();

        let mut stmt = conn.prepare(
            "SELECT hostname, first_seen, last_seen, tags, version, platform, status FROM hosts ORDER BY hostname",
        )?;
        let rows = stmt.query_map([], row_to_host)?;

        let mut out = Vec::new();
        for row in rows {
            let host = row?;
            if include_inactive || host.is_active(now, self.liveness_window_secs) {
                out.push(host);
            }
        }
        Ok(out)
    }

    pub fn get(&self, hostname: &str) -> AppResult<Option<Host>> {
        let conn = self.conn.lock();
        match self.fetch(&conn, hostname) {
            Ok(host) => Ok(Some(host)),
            Err(e) => match &e {
                crate::error::AppError::NotFound(_) => Ok(None),
                _ => Err(e),
            },
        }
    }

    pub fn mark_inactive(&self, hostname: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE hosts SET status = 'inactive' WHERE hostname = ?1",
            params![hostname],
        )?;
        Ok(updated > 0)
    }

    /// Mark any host past the liveness window inactive. Disabled by
    /// default; liveness is otherwise computed implicitly from
    /// `last_seen` at read time.
    pub fn reap_inactive(&self) -> AppResult<usize> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        let updated = conn.execute(
            "UPDATE hosts SET status = 'inactive'
             WHERE status = 'active' AND (?1 - last_seen) > ?2",
            params![now, self.liveness_window_secs],
        )?;
        Ok(updated)
    }

    fn fetch(&self, conn: &Connection, hostname: &str) -> AppResult<Host> {
        conn.query_row(
            "SELECT hostname, first_seen, last_seen, tags, version, platform, status FROM hosts WHERE hostname = ?1",
            params![hostname],
            row_to_host,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                crate::error::AppError::NotFound(format!("unknown host: {hostname}"))
            }
            other => other.into(),
        })
    }
}

fn row_to_host(row: &rusqlite::Row) -> rusqlite::Result<Host> {
    Ok(Host {
        hostname: row.get(0)?,
        first_seen: row.get(1)?,
        last_seen: row.get(2)?,
        tags: row.get(3)?,
        version: row.get(4)?,
        platform: row.get(5)?,
        status: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (SampleStore, HostRegistry) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = SampleStore::new(file.path().to_str().unwrap()).unwrap();
        std::mem::forget(file);
        let registry = HostRegistry::new(&store, 300);
        (store, registry)
    }

    #[test]
    fn register_is_idempotent_and_keeps_last_committed_seen() {
        let (_store, registry) = test_registry();
        registry.register("web-01", None, None, None).unwrap();
        registry.register("web-01", Some("1.2.0"), None, None).unwrap();

        let hosts = registry.list(true).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn register_persists_tags_and_overwrites_on_subsequent_calls() {
        let (_store, registry) = test_registry();
        registry.register("web-01", None, None, Some("env=prod")).unwrap();
        let host = registry.get("web-01").unwrap().unwrap();
        assert_eq!(host.tags, "env=prod");

        registry.register("web-01", None, None, None).unwrap();
        let host = registry.get("web-01").unwrap().unwrap();
        assert_eq!(host.tags, "");
    }

    #[test]
    fn heartbeat_on_unknown_host_is_a_no_op() {
        let (_store, registry) = test_registry();
        let updated = registry.heartbeat("ghost").unwrap();
        assert!(!updated);
        assert!(registry.get("ghost").unwrap().is_none());
    }

    #[test]
    fn register_heartbeat_mark_inactive_register_ends_active() {
        let (_store, registry) = test_registry();
        registry.register("web-01", None, None, None).unwrap();
        registry.heartbeat("web-01").unwrap();
        registry.mark_inactive("web-01").unwrap();
        registry.register("web-01", None, None, None).unwrap();

        let host = registry.get("web-01").unwrap().unwrap();
        assert_eq!(host.status, "active");
    }

    #[test]
    fn list_excludes_hosts_past_liveness_window() {
        let (_store, registry) = test_registry();
        registry.register("web-01", None, None, None).unwrap();
        {
            let conn = registry.conn.lock();
            conn.execute(
                "UPDATE hosts SET last_seen = last_seen - 1000 WHERE hostname = 'web-01'",
                [],
            )
            .unwrap();
        }

        assert!(registry.list(false).unwrap().is_empty());
        assert_eq!(registry.list(true).unwrap().len(), 1);
    }
}
