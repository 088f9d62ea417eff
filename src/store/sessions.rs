//! Session repositories
//!
//! Upload and download sessions share a column layout across two tables.
//! The session row is the single progress channel: workers apply counter
//! deltas transactionally, external callers poll.

use serde::{Deserialize, Serialize};

use super::backend::Row;
use super::{parse_ts, ts, Tx};
use crate::error::ErrorKind;
use crate::types::{Session, SessionKind, SessionStatus};
use crate::{Error, Result};

const SESSION_COLUMNS: &str = "session_id, subject_id, destination, total_count,
    completed_count, failed_count, total_bytes, transferred_bytes, status, error_kind,
    error_message, started_at, ended_at";

/// Bounded diagnostic trail kept on the session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: chrono::DateTime<chrono::Utc>,
    pub kind: String,
    pub message: String,
}

const MAX_EVENTS: usize = 64;

fn table(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Upload => "upload_sessions",
        SessionKind::Download => "download_sessions",
    }
}

fn session_from_row(kind: SessionKind, row: &Row) -> Result<Session> {
    let error_kind = row
        .opt_text(9)?
        .map(|s| {
            serde_json::from_str::<ErrorKind>(&format!("\"{}\"", s))
                .map_err(|e| Error::storage(format!("bad error kind '{}': {}", s, e)))
        })
        .transpose()?;
    Ok(Session {
        session_id: row.text(0)?.to_string(),
        kind,
        subject_id: row.text(1)?.to_string(),
        destination: row.opt_text(2)?.map(str::to_string),
        total_count: row.u64(3)?,
        completed_count: row.u64(4)?,
        failed_count: row.u64(5)?,
        total_bytes: row.u64(6)?,
        transferred_bytes: row.u64(7)?,
        status: SessionStatus::parse(row.text(8)?)?,
        error_kind,
        error_message: row.opt_text(10)?.map(str::to_string),
        started_at: parse_ts(row.text(11)?)?,
        ended_at: row.opt_text(12)?.map(parse_ts).transpose()?,
    })
}

fn error_kind_str(kind: ErrorKind) -> Result<String> {
    let quoted = serde_json::to_string(&kind)?;
    Ok(quoted.trim_matches('"').to_string())
}

impl Tx<'_> {
    pub async fn insert_session(&mut self, session: &Session) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (session_id, subject_id, destination, total_count,
                completed_count, failed_count, total_bytes, transferred_bytes, status,
                error_kind, error_message, started_at, ended_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            table(session.kind)
        );
        self.execute(
            &sql,
            &[
                session.session_id.as_str().into(),
                session.subject_id.as_str().into(),
                session.destination.as_deref().into(),
                session.total_count.into(),
                session.completed_count.into(),
                session.failed_count.into(),
                session.total_bytes.into(),
                session.transferred_bytes.into(),
                session.status.as_str().into(),
                session
                    .error_kind
                    .map(error_kind_str)
                    .transpose()?
                    .into(),
                session.error_message.as_deref().into(),
                ts(session.started_at).into(),
                session.ended_at.map(ts).into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_session(
        &mut self,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE session_id = $1",
            SESSION_COLUMNS,
            table(kind)
        );
        match self.query_opt(&sql, &[session_id.into()]).await? {
            Some(row) => Ok(Some(session_from_row(kind, &row)?)),
            None => Ok(None),
        }
    }

    /// Look a session up without knowing its pipeline.
    pub async fn find_session(&mut self, session_id: &str) -> Result<Option<Session>> {
        if let Some(s) = self.get_session(SessionKind::Upload, session_id).await? {
            return Ok(Some(s));
        }
        self.get_session(SessionKind::Download, session_id).await
    }

    pub async fn set_session_totals(
        &mut self,
        kind: SessionKind,
        session_id: &str,
        total_count: u64,
        total_bytes: u64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET total_count = $1, total_bytes = $2 WHERE session_id = $3",
            table(kind)
        );
        self.execute(
            &sql,
            &[total_count.into(), total_bytes.into(), session_id.into()],
        )
        .await?;
        Ok(())
    }

    /// Apply progress deltas; counters only grow.
    pub async fn bump_session_progress(
        &mut self,
        kind: SessionKind,
        session_id: &str,
        completed_delta: u64,
        failed_delta: u64,
        bytes_delta: u64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET completed_count = completed_count + $1,
                failed_count = failed_count + $2,
                transferred_bytes = transferred_bytes + $3
             WHERE session_id = $4",
            table(kind)
        );
        self.execute(
            &sql,
            &[
                completed_delta.into(),
                failed_delta.into(),
                bytes_delta.into(),
                session_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn finish_session(
        &mut self,
        kind: SessionKind,
        session_id: &str,
        status: SessionStatus,
        error: Option<&Error>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = $1, error_kind = $2, error_message = $3, ended_at = $4
             WHERE session_id = $5",
            table(kind)
        );
        let (error_kind, error_message) = match error {
            Some(e) => (
                Some(error_kind_str(e.kind())?),
                Some(e.to_string()),
            ),
            None => (None, None),
        };
        self.execute(
            &sql,
            &[
                status.as_str().into(),
                error_kind.into(),
                error_message.into(),
                ts(chrono::Utc::now()).into(),
                session_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Mark a running session cancelled; terminal sessions are untouched so
    /// cancellation is idempotent.
    pub async fn cancel_session(&mut self, kind: SessionKind, session_id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = $1, ended_at = $2
             WHERE session_id = $3 AND status = $4",
            table(kind)
        );
        let affected = self
            .execute(
                &sql,
                &[
                    SessionStatus::Cancelled.as_str().into(),
                    ts(chrono::Utc::now()).into(),
                    session_id.into(),
                    SessionStatus::Running.as_str().into(),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Append to the bounded diagnostic event ring on the session row.
    pub async fn append_session_event(
        &mut self,
        kind: SessionKind,
        session_id: &str,
        event_kind: &str,
        message: &str,
    ) -> Result<()> {
        let select = format!(
            "SELECT events FROM {} WHERE session_id = $1",
            table(kind)
        );
        let existing = self.query_opt(&select, &[session_id.into()]).await?;
        let mut events: Vec<SessionEvent> = match existing.as_ref().and_then(|r| r.opt_blob(0).ok().flatten())
        {
            Some(blob) => rmp_serde::from_slice(blob).unwrap_or_default(),
            None => Vec::new(),
        };
        events.push(SessionEvent {
            at: chrono::Utc::now(),
            kind: event_kind.to_string(),
            message: message.to_string(),
        });
        if events.len() > MAX_EVENTS {
            let excess = events.len() - MAX_EVENTS;
            events.drain(..excess);
        }
        let blob = rmp_serde::to_vec(&events)
            .map_err(|e| Error::storage(format!("event encode: {}", e)))?;
        let update = format!(
            "UPDATE {} SET events = $1 WHERE session_id = $2",
            table(kind)
        );
        self.execute(&update, &[blob.into(), session_id.into()]).await?;
        Ok(())
    }

    pub async fn session_events(
        &mut self,
        kind: SessionKind,
        session_id: &str,
    ) -> Result<Vec<SessionEvent>> {
        let select = format!(
            "SELECT events FROM {} WHERE session_id = $1",
            table(kind)
        );
        let row = self.query_opt(&select, &[session_id.into()]).await?;
        match row.as_ref().and_then(|r| r.opt_blob(0).ok().flatten()) {
            Some(blob) => rmp_serde::from_slice(blob)
                .map_err(|e| Error::storage(format!("event decode: {}", e))),
            None => Ok(Vec::new()),
        }
    }
}

/// Construct a fresh running session row.
pub fn new_session(
    kind: SessionKind,
    subject_id: &str,
    destination: Option<&str>,
) -> Session {
    Session {
        session_id: crate::types::new_entity_id(),
        kind,
        subject_id: subject_id.to_string(),
        destination: destination.map(str::to_string),
        total_count: 0,
        completed_count: 0,
        failed_count: 0,
        total_bytes: 0,
        transferred_bytes: 0,
        status: SessionStatus::Running,
        error_kind: None,
        error_message: None,
        started_at: chrono::Utc::now(),
        ended_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::open_temp;
    use super::*;

    #[tokio::test]
    async fn test_session_progress_and_finish() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        let session = new_session(SessionKind::Upload, "f1", None);
        tx.insert_session(&session).await.unwrap();
        tx.set_session_totals(SessionKind::Upload, &session.session_id, 10, 1000)
            .await
            .unwrap();
        tx.bump_session_progress(SessionKind::Upload, &session.session_id, 3, 1, 300)
            .await
            .unwrap();

        let loaded = tx
            .get_session(SessionKind::Upload, &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.total_count, 10);
        assert_eq!(loaded.completed_count, 3);
        assert_eq!(loaded.failed_count, 1);
        assert_eq!(loaded.transferred_bytes, 300);

        tx.finish_session(
            SessionKind::Upload,
            &session.session_id,
            SessionStatus::Completed,
            None,
        )
        .await
        .unwrap();
        let loaded = tx
            .find_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.ended_at.is_some());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        let session = new_session(SessionKind::Download, "share-1", Some("/dst"));
        tx.insert_session(&session).await.unwrap();

        assert!(tx
            .cancel_session(SessionKind::Download, &session.session_id)
            .await
            .unwrap());
        // Second cancel is a no-op, not an error.
        assert!(!tx
            .cancel_session(SessionKind::Download, &session.session_id)
            .await
            .unwrap());
        let loaded = tx
            .get_session(SessionKind::Download, &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, SessionStatus::Cancelled);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reported_without_internals() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        let session = new_session(SessionKind::Upload, "f1", None);
        tx.insert_session(&session).await.unwrap();
        let err = crate::Error::Auth("482 service unavailable".to_string());
        tx.finish_session(
            SessionKind::Upload,
            &session.session_id,
            SessionStatus::Failed,
            Some(&err),
        )
        .await
        .unwrap();
        let loaded = tx
            .get_session(SessionKind::Upload, &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.error_kind, Some(crate::error::ErrorKind::Auth));
        assert!(loaded.error_message.is_some());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_ring_bounded() {
        let (_dir, store) = open_temp().await;
        let mut tx = store.begin().await.unwrap();
        let session = new_session(SessionKind::Upload, "f1", None);
        tx.insert_session(&session).await.unwrap();
        for i in 0..70 {
            tx.append_session_event(
                SessionKind::Upload,
                &session.session_id,
                "retry",
                &format!("attempt {}", i),
            )
            .await
            .unwrap();
        }
        let events = tx
            .session_events(SessionKind::Upload, &session.session_id)
            .await
            .unwrap();
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events.last().unwrap().message, "attempt 69");
        tx.commit().await.unwrap();
    }
}
