//! SQL backend seam
//!
//! Both store backends implement this narrow executor interface; every
//! typed repository is written once against it. SQL text uses `$N`
//! placeholders with parameters in first-use order, which both dialects
//! accept, so statements are shared verbatim.

use async_trait::async_trait;

use crate::{Error, Result};

/// A bind parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// One result row; cells are addressed positionally in select order.
#[derive(Debug, Clone)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn i64(&self, idx: usize) -> Result<i64> {
        match self.cell(idx)? {
            Value::Integer(v) => Ok(*v),
            other => Err(type_mismatch(idx, "integer", other)),
        }
    }

    pub fn u64(&self, idx: usize) -> Result<u64> {
        Ok(self.i64(idx)? as u64)
    }

    pub fn u32(&self, idx: usize) -> Result<u32> {
        Ok(self.i64(idx)? as u32)
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        Ok(self.i64(idx)? != 0)
    }

    pub fn opt_u64(&self, idx: usize) -> Result<Option<u64>> {
        match self.cell(idx)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v as u64)),
            other => Err(type_mismatch(idx, "integer or null", other)),
        }
    }

    pub fn text(&self, idx: usize) -> Result<&str> {
        match self.cell(idx)? {
            Value::Text(v) => Ok(v),
            other => Err(type_mismatch(idx, "text", other)),
        }
    }

    pub fn opt_text(&self, idx: usize) -> Result<Option<&str>> {
        match self.cell(idx)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v)),
            other => Err(type_mismatch(idx, "text or null", other)),
        }
    }

    pub fn blob(&self, idx: usize) -> Result<&[u8]> {
        match self.cell(idx)? {
            Value::Blob(v) => Ok(v),
            other => Err(type_mismatch(idx, "blob", other)),
        }
    }

    pub fn opt_blob(&self, idx: usize) -> Result<Option<&[u8]>> {
        match self.cell(idx)? {
            Value::Null => Ok(None),
            Value::Blob(v) => Ok(Some(v.as_slice())),
            other => Err(type_mismatch(idx, "blob or null", other)),
        }
    }

    fn cell(&self, idx: usize) -> Result<&Value> {
        self.0
            .get(idx)
            .ok_or_else(|| Error::storage(format!("row has no column {}", idx)))
    }
}

fn type_mismatch(idx: usize, expected: &str, got: &Value) -> Error {
    Error::storage(format!(
        "column {} expected {}, got {:?}",
        idx, expected, got
    ))
}

/// Which SQL dialect a backend speaks; only DDL branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Minimal executor both backends provide. Implementations map their
/// native error codes onto the store taxonomy: unique and foreign-key
/// violations become distinct `Storage` errors, lock/serialization
/// failures become `Conflict`, everything else `Storage`.
#[async_trait]
pub trait SqlBackend: Send {
    fn dialect(&self) -> Dialect;

    /// Run a statement; returns affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query; returns all rows in select-list order.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

pub fn unique_violation(detail: impl std::fmt::Display) -> Error {
    Error::storage(format!("unique violation: {}", detail))
}

pub fn foreign_key_violation(detail: impl std::fmt::Display) -> Error {
    Error::storage(format!("foreign key violation: {}", detail))
}
