//! Metadata store
//!
//! A transactional store with two interchangeable backends: an embedded
//! single-file engine (SQLite) and a server-backed engine (PostgreSQL).
//! Higher layers never branch on backend; they open a [`Store`] and work
//! through typed repository methods on [`Tx`].
//!
//! Access is serialized through a single connection guarded by an async
//! mutex. Transactions are explicit; a `Tx` dropped without commit flags
//! the connection for rollback, which the next acquisition performs before
//! doing anything else.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::ServerStoreSection;
use crate::{Error, Result};

pub mod backend;
pub mod credentials;
pub mod files;
pub mod folders;
pub mod postgres;
pub mod queue;
pub mod schema;
pub mod segments;
pub mod sessions;
pub mod shares;
pub mod sqlite;
pub mod users;

use backend::{Dialect, Row, SqlBackend, Value};

/// Store backend selection.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Embedded { path: PathBuf },
    Server(ServerStoreSection),
}

struct StoreInner {
    backend: Box<dyn SqlBackend>,
    needs_rollback: bool,
}

/// Handle to the metadata store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

/// Create a store from config and bring the schema up to date.
pub async fn open_store(config: StoreConfig) -> Result<Store> {
    let mut backend: Box<dyn SqlBackend> = match config {
        StoreConfig::Embedded { path } => Box::new(sqlite::SqliteBackend::open(path)?),
        StoreConfig::Server(cfg) => Box::new(postgres::PostgresBackend::connect(&cfg).await?),
    };
    schema::apply_migrations(backend.as_mut()).await?;
    Ok(Store {
        inner: Arc::new(Mutex::new(StoreInner {
            backend,
            needs_rollback: false,
        })),
    })
}

impl Store {
    /// Begin a transaction. Holds the connection until commit/rollback/drop.
    pub async fn begin(&self) -> Result<Tx<'_>> {
        let mut guard = self.inner.lock().await;
        if guard.needs_rollback {
            guard.backend.execute("ROLLBACK", &[]).await.ok();
            guard.needs_rollback = false;
        }
        let begin = match guard.backend.dialect() {
            // Grab the write lock up front so conflicts surface at BEGIN,
            // not at the first write.
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        };
        guard.backend.execute(begin, &[]).await?;
        Ok(Tx {
            guard,
            depth: 0,
            open: true,
        })
    }
}

/// An open transaction. All typed repository methods live on this type;
/// see the sibling modules for the per-entity surface.
pub struct Tx<'a> {
    guard: MutexGuard<'a, StoreInner>,
    depth: u32,
    open: bool,
}

impl Tx<'_> {
    pub(crate) async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.guard.backend.execute(sql, params).await
    }

    pub(crate) async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.guard.backend.query(sql, params).await
    }

    pub(crate) async fn query_opt(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    pub async fn commit(mut self) -> Result<()> {
        self.guard.backend.execute("COMMIT", &[]).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.guard.backend.execute("ROLLBACK", &[]).await?;
        self.open = false;
        Ok(())
    }

    /// Enter a nested scope. Pair with [`Tx::release_savepoint`] or
    /// [`Tx::rollback_savepoint`].
    pub async fn savepoint(&mut self) -> Result<()> {
        self.depth += 1;
        let sql = format!("SAVEPOINT sp_{}", self.depth);
        self.guard.backend.execute(&sql, &[]).await?;
        Ok(())
    }

    pub async fn release_savepoint(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::storage("no savepoint to release"));
        }
        let sql = format!("RELEASE SAVEPOINT sp_{}", self.depth);
        self.guard.backend.execute(&sql, &[]).await?;
        self.depth -= 1;
        Ok(())
    }

    pub async fn rollback_savepoint(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::storage("no savepoint to roll back"));
        }
        let sql = format!("ROLLBACK TO SAVEPOINT sp_{}", self.depth);
        self.guard.backend.execute(&sql, &[]).await?;
        self.depth -= 1;
        Ok(())
    }

    /// Read an opaque value from the meta table.
    pub async fn meta_get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = self
            .query_opt("SELECT value FROM meta WHERE key = $1", &[key.into()])
            .await?;
        match row {
            Some(row) => Ok(Some(row.blob(0)?.to_vec())),
            None => Ok(None),
        }
    }

    pub async fn meta_put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.execute(
            "INSERT INTO meta (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            &[key.into(), value.into()],
        )
        .await?;
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.open {
            // Cannot await here; the next acquisition rolls back first.
            self.guard.needs_rollback = true;
        }
    }
}

/// Fixed-width RFC 3339 so lexicographic order on stored text matches
/// chronological order (queue claims compare `not_before` in SQL).
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Open an embedded store in a fresh temp dir.
    pub(crate) async fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(StoreConfig::Embedded {
            path: dir.path().join("meta.db"),
        })
        .await
        .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_applies_migrations() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        let rows = tx
            .query("SELECT version FROM migrations", &[])
            .await
            .unwrap();
        assert!(!rows.is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let (_dir, store) = open_temp().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.meta_put("k", b"v").await.unwrap();
            // Dropped without commit.
        }
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.meta_get("k").await.unwrap(), None);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_savepoints_nest() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.meta_put("outer", b"1").await.unwrap();
        tx.savepoint().await.unwrap();
        tx.meta_put("inner", b"2").await.unwrap();
        tx.rollback_savepoint().await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.meta_get("outer").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(tx.meta_get("inner").await.unwrap(), None);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_meta_upsert() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        tx.meta_put("kdf", b"old").await.unwrap();
        tx.meta_put("kdf", b"new").await.unwrap();
        assert_eq!(tx.meta_get("kdf").await.unwrap(), Some(b"new".to_vec()));
        tx.commit().await.unwrap();
    }
}
