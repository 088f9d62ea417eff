//! Embedded single-file backend (SQLite via rusqlite)
//!
//! One connection, WAL journal, foreign keys on. Calls are synchronous and
//! brief; the store serializes access through its own mutex so a blocking
//! statement never races another task on the same connection.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};

use super::backend::{foreign_key_violation, unique_violation, Dialect, Row, SqlBackend, Value};
use crate::{Error, Result};

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(map_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(map_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(map_err)?;
        Ok(Self { conn })
    }

    fn bind_params(params: &[Value]) -> Vec<rusqlite::types::Value> {
        params
            .iter()
            .map(|v| match v {
                Value::Null => rusqlite::types::Value::Null,
                Value::Integer(i) => rusqlite::types::Value::Integer(*i),
                Value::Real(f) => rusqlite::types::Value::Real(*f),
                Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
                Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
            })
            .collect()
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let bound = Self::bind_params(params);
        let affected = self
            .conn
            .execute(sql, rusqlite::params_from_iter(bound))
            .map_err(map_err)?;
        Ok(affected as u64)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let bound = Self::bind_params(params);
        let mut stmt = self.conn.prepare(sql).map_err(map_err)?;
        let column_count = stmt.column_count();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(bound))
            .map_err(map_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_err)? {
            let mut cells = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let cell = match row.get_ref(idx).map_err(map_err)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(i) => Value::Integer(i),
                    ValueRef::Real(f) => Value::Real(f),
                    ValueRef::Text(t) => Value::Text(
                        std::str::from_utf8(t)
                            .map_err(|e| Error::storage(format!("non-utf8 text column: {}", e)))?
                            .to_string(),
                    ),
                    ValueRef::Blob(b) => Value::Blob(b.to_vec()),
                };
                cells.push(cell);
            }
            out.push(Row(cells));
        }
        Ok(out)
    }
}

fn map_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(code, ref message) = e {
        let detail = message.clone().unwrap_or_else(|| code.to_string());
        // Extended result codes distinguish the constraint family.
        const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;
        const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
        const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
        match (code.code, code.extended_code) {
            (_, SQLITE_CONSTRAINT_UNIQUE) | (_, SQLITE_CONSTRAINT_PRIMARYKEY) => {
                return unique_violation(detail)
            }
            (_, SQLITE_CONSTRAINT_FOREIGNKEY) => return foreign_key_violation(detail),
            (ErrorCode::DatabaseBusy, _) | (ErrorCode::DatabaseLocked, _) => {
                return Error::Conflict(detail)
            }
            _ => return Error::storage(detail),
        }
    }
    Error::storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path().join("test.db")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let (_dir, mut backend) = open_temp().await;
        backend
            .execute("CREATE TABLE t (a BIGINT, b TEXT, c BLOB)", &[])
            .await
            .unwrap();
        backend
            .execute(
                "INSERT INTO t (a, b, c) VALUES ($1, $2, $3)",
                &[7i64.into(), "seven".into(), vec![1u8, 2].into()],
            )
            .await
            .unwrap();

        let rows = backend
            .query("SELECT a, b, c FROM t WHERE a = $1", &[7i64.into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].i64(0).unwrap(), 7);
        assert_eq!(rows[0].text(1).unwrap(), "seven");
        assert_eq!(rows[0].blob(2).unwrap(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_unique_violation_mapped() {
        let (_dir, mut backend) = open_temp().await;
        backend
            .execute("CREATE TABLE t (a BIGINT UNIQUE)", &[])
            .await
            .unwrap();
        backend
            .execute("INSERT INTO t (a) VALUES ($1)", &[1i64.into()])
            .await
            .unwrap();
        let err = backend
            .execute("INSERT INTO t (a) VALUES ($1)", &[1i64.into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unique violation"));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let (_dir, mut backend) = open_temp().await;
        backend
            .execute("CREATE TABLE t (a BIGINT)", &[])
            .await
            .unwrap();
        backend.execute("BEGIN", &[]).await.unwrap();
        backend
            .execute("INSERT INTO t (a) VALUES ($1)", &[1i64.into()])
            .await
            .unwrap();
        backend.execute("ROLLBACK", &[]).await.unwrap();
        let rows = backend.query("SELECT a FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }
}
