//! Keel persistence: SQLite-backed revision snapshots.
//! Keep code tiny and predictable; calls are synchronous under one connection.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::{RevisionSnapshot, RevisionStore, StoreError};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

pub struct SqliteRevisionStore {
    db: Mutex<Connection>,
}

impl SqliteRevisionStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS revisions (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                component TEXT NOT NULL,
                revision  INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                snapshot  BLOB NOT NULL,
                PRIMARY KEY (namespace, name)
            )",
            [],
        )
        .context("creating revisions table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_revisions_component ON revisions(namespace, component, revision)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Backend("sqlite connection poisoned".into()))
    }
}

fn backend(e: rusqlite::Error) -> StoreError { StoreError::Backend(e.to_string()) }

fn decode(blob: &[u8]) -> Result<RevisionSnapshot, StoreError> {
    serde_json::from_slice(&maybe_decompress(blob)).map_err(|e| StoreError::Invalid(format!("corrupt revision snapshot: {}", e)))
}

#[async_trait]
impl RevisionStore for SqliteRevisionStore {
    async fn put(&self, s: &RevisionSnapshot) -> Result<(String, i64), StoreError> {
        let started = Instant::now();
        let body = serde_json::to_vec(s).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let db = self.conn()?;
        let res = db.execute(
            "INSERT INTO revisions(namespace, name, component, revision, ts, snapshot) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![s.namespace, s.name, s.component_name, s.revision, now_ts(), maybe_compress(&body)],
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(f, _)) if f.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::AlreadyExists(format!("revision {}/{}", s.namespace, s.name)));
            }
            Err(e) => return Err(backend(e)),
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok((s.name.clone(), s.revision))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<RevisionSnapshot>, StoreError> {
        let started = Instant::now();
        let db = self.conn()?;
        let blob: Option<Vec<u8>> = db
            .query_row("SELECT snapshot FROM revisions WHERE namespace = ?1 AND name = ?2", params![namespace, name], |r| r.get(0))
            .optional()
            .map_err(backend)?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        blob.map(|b| decode(&b)).transpose()
    }

    async fn list(&self, namespace: &str, component_name: &str) -> Result<Vec<RevisionSnapshot>, StoreError> {
        let db = self.conn()?;
        let mut stmt = db
            .prepare("SELECT snapshot FROM revisions WHERE namespace = ?1 AND component = ?2 ORDER BY revision ASC, ts ASC")
            .map_err(backend)?;
        let mut rows = stmt.query(params![namespace, component_name]).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let blob: Vec<u8> = row.get(0).map_err(backend)?;
            out.push(decode(&blob)?);
        }
        Ok(out)
    }

    /// Keep the latest `retain` by revision number in one statement.
    async fn prune(&self, namespace: &str, component_name: &str, retain: usize) -> Result<usize, StoreError> {
        let db = self.conn()?;
        let n = db
            .execute(
                "DELETE FROM revisions
                 WHERE namespace = ?1 AND component = ?2
                   AND name NOT IN (
                       SELECT name FROM revisions WHERE namespace = ?1 AND component = ?2 ORDER BY revision DESC, ts DESC LIMIT ?3
                   )",
                params![namespace, component_name, retain as i64],
            )
            .map_err(backend)?;
        if n > 0 { debug!(namespace, component = component_name, pruned = n, "pruned revisions"); }
        Ok(n)
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.conn()?.execute("DELETE FROM revisions WHERE namespace = ?1 AND name = ?2", params![namespace, name]).map_err(backend)?;
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 { time::OffsetDateTime::now_utc().unix_timestamp() }

pub fn maybe_compress(bytes: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(bytes, lvl).unwrap_or_else(|_| bytes.to_vec());
    }
    #[allow(unreachable_code)]
    bytes.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::model::Component;

    fn temp_db() -> String {
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        std::env::temp_dir().join(f).to_string_lossy().to_string()
    }

    fn snap(name: &str, revision: i64) -> RevisionSnapshot {
        RevisionSnapshot { name: name.into(), namespace: "ns".into(), component_name: "web".into(), revision, component: Component::default() }
    }

    #[tokio::test]
    async fn put_get_list_prune() {
        let s = SqliteRevisionStore::open(&temp_db()).unwrap();
        for i in 1..=5 {
            s.put(&snap(&format!("web-{}", i), i)).await.unwrap();
        }
        assert!(matches!(s.put(&snap("web-1", 9)).await, Err(StoreError::AlreadyExists(_))));
        assert_eq!(s.get("ns", "web-3").await.unwrap().unwrap().revision, 3);
        assert!(s.get("other", "web-3").await.unwrap().is_none());

        assert_eq!(s.prune("ns", "web", 3).await.unwrap(), 2);
        let left: Vec<i64> = s.list("ns", "web").await.unwrap().iter().map(|r| r.revision).collect();
        assert_eq!(left, vec![3, 4, 5]);

        s.remove("ns", "web-4").await.unwrap();
        assert_eq!(s.list("ns", "web").await.unwrap().len(), 2);
    }

    #[test]
    fn compression_round_trips() {
        let body = br#"{"k":"v"}"#;
        assert_eq!(maybe_decompress(&maybe_compress(body)), body.to_vec());
    }
}
