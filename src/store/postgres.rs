//! Server-backed backend (PostgreSQL via tokio-postgres)
//!
//! Speaks the same `$N` statement set as the embedded backend. The
//! connection task is spawned onto the runtime; statement errors map onto
//! the store taxonomy by SQLSTATE.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};

use super::backend::{foreign_key_violation, unique_violation, Dialect, Row, SqlBackend, Value};
use crate::config::ServerStoreSection;
use crate::{Error, Result};

pub struct PostgresBackend {
    client: Client,
}

impl PostgresBackend {
    pub async fn connect(cfg: &ServerStoreSection) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&cfg.host)
            .port(cfg.port)
            .dbname(&cfg.dbname)
            .user(&cfg.user)
            .password(&cfg.password);

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| Error::storage(format!("postgres connect: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection task ended: {}", e);
            }
        });

        Ok(Self { client })
    }

    fn bind_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
        params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }

    fn convert_row(row: &tokio_postgres::Row) -> Result<Row> {
        let mut cells = Vec::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            let ty = column.type_();
            let cell = if *ty == Type::INT2 {
                row.try_get::<_, Option<i16>>(idx)
                    .map(|v| v.map(|v| Value::Integer(v as i64)))
            } else if *ty == Type::INT4 {
                row.try_get::<_, Option<i32>>(idx)
                    .map(|v| v.map(|v| Value::Integer(v as i64)))
            } else if *ty == Type::INT8 {
                row.try_get::<_, Option<i64>>(idx)
                    .map(|v| v.map(Value::Integer))
            } else if *ty == Type::FLOAT8 {
                row.try_get::<_, Option<f64>>(idx)
                    .map(|v| v.map(Value::Real))
            } else if *ty == Type::BOOL {
                row.try_get::<_, Option<bool>>(idx)
                    .map(|v| v.map(|v| Value::Integer(v as i64)))
            } else if *ty == Type::BYTEA {
                row.try_get::<_, Option<Vec<u8>>>(idx)
                    .map(|v| v.map(Value::Blob))
            } else {
                row.try_get::<_, Option<String>>(idx)
                    .map(|v| v.map(Value::Text))
            }
            .map_err(|e| Error::storage(format!("column decode: {}", e)))?
            .unwrap_or(Value::Null);
            cells.push(cell);
        }
        Ok(Row(cells))
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Real(f) => f.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Blob(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let bound = Self::bind_params(params);
        self.client
            .execute(sql, &bound)
            .await
            .map_err(map_err)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let bound = Self::bind_params(params);
        let rows = self.client.query(sql, &bound).await.map_err(map_err)?;
        rows.iter().map(Self::convert_row).collect()
    }
}

fn map_err(e: tokio_postgres::Error) -> Error {
    if let Some(state) = e.code() {
        if *state == SqlState::UNIQUE_VIOLATION {
            return unique_violation(e);
        }
        if *state == SqlState::FOREIGN_KEY_VIOLATION {
            return foreign_key_violation(e);
        }
        if *state == SqlState::T_R_SERIALIZATION_FAILURE
            || *state == SqlState::T_R_DEADLOCK_DETECTED
        {
            return Error::Conflict(e.to_string());
        }
    }
    Error::storage(e.to_string())
}
