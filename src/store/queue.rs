//! Durable work queues
//!
//! Upload rows reference one segment copy each and drain in priority-band
//! order. Download rows carry their plan entry as an opaque blob so a
//! fetch can resume without the core index in hand. Claims mark a row
//! inflight under a worker lease; a sweeper returns expired leases to
//! pending so crashed workers never orphan work.

use chrono::{DateTime, Duration, Utc};

use super::backend::Row;
use super::{parse_ts, ts, Tx};
use crate::types::{DownloadQueueRow, Priority, QueueState, UploadQueueRow};
use crate::Result;

const UPLOAD_COLUMNS: &str = "id, session_id, segment_id, priority, state, retry_count,
    not_before, lease_expires_at, worker_id";

const DOWNLOAD_COLUMNS: &str = "id, session_id, plan_key, plan_blob, state, retry_count,
    not_before, lease_expires_at, worker_id";

fn upload_from_row(row: &Row) -> Result<UploadQueueRow> {
    Ok(UploadQueueRow {
        queue_id: row.i64(0)?,
        session_id: row.text(1)?.to_string(),
        segment_id: row.text(2)?.to_string(),
        priority: Priority::from_i64(row.i64(3)?)?,
        state: QueueState::parse(row.text(4)?)?,
        retry_count: row.u32(5)?,
        not_before: parse_ts(row.text(6)?)?,
        lease_expires_at: row.opt_text(7)?.map(parse_ts).transpose()?,
        worker_id: row.opt_text(8)?.map(str::to_string),
    })
}

fn download_from_row(row: &Row) -> Result<DownloadQueueRow> {
    Ok(DownloadQueueRow {
        queue_id: row.i64(0)?,
        session_id: row.text(1)?.to_string(),
        plan_blob: row.blob(3)?.to_vec(),
        state: QueueState::parse(row.text(4)?)?,
        retry_count: row.u32(5)?,
        not_before: parse_ts(row.text(6)?)?,
        lease_expires_at: row.opt_text(7)?.map(parse_ts).transpose()?,
        worker_id: row.opt_text(8)?.map(str::to_string),
    })
}

impl Tx<'_> {
    pub async fn enqueue_upload(
        &mut self,
        session_id: &str,
        segment_id: &str,
        priority: Priority,
    ) -> Result<()> {
        self.execute(
            "INSERT INTO upload_queue (session_id, segment_id, priority, state, not_before)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                session_id.into(),
                segment_id.into(),
                priority.as_i64().into(),
                QueueState::Pending.as_str().into(),
                ts(Utc::now()).into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Claim the highest-priority due row, marking it inflight under a
    /// lease. Atomic: the subselect and update run as one statement.
    pub async fn claim_upload(
        &mut self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<UploadQueueRow>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE upload_queue
             SET state = $1, worker_id = $2, lease_expires_at = $3
             WHERE id = (
                 SELECT id FROM upload_queue
                 WHERE state = $4 AND not_before <= $5
                 ORDER BY priority, id
                 LIMIT 1
             )
             RETURNING {}",
            UPLOAD_COLUMNS
        );
        let rows = self
            .query(
                &sql,
                &[
                    QueueState::Inflight.as_str().into(),
                    worker_id.into(),
                    ts(now + lease).into(),
                    QueueState::Pending.as_str().into(),
                    ts(now).into(),
                ],
            )
            .await?;
        rows.first().map(upload_from_row).transpose()
    }

    /// Successful post: the queue row is done and removed.
    pub async fn complete_upload(&mut self, queue_id: i64) -> Result<()> {
        self.execute(
            "DELETE FROM upload_queue WHERE id = $1",
            &[queue_id.into()],
        )
        .await?;
        Ok(())
    }

    /// Transient failure: back to pending with a backoff deadline.
    pub async fn reschedule_upload(
        &mut self,
        queue_id: i64,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(
            "UPDATE upload_queue
             SET state = $1, retry_count = retry_count + 1, not_before = $2,
                 lease_expires_at = NULL, worker_id = NULL
             WHERE id = $3",
            &[
                QueueState::Pending.as_str().into(),
                ts(not_before).into(),
                queue_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Permanent failure: the row is dropped; the segment row records the
    /// failed state.
    pub async fn drop_upload(&mut self, queue_id: i64) -> Result<()> {
        self.complete_upload(queue_id).await
    }

    /// Push a row back without consuming its retry budget (another worker
    /// currently owns the segment).
    pub async fn delay_upload(&mut self, queue_id: i64, not_before: DateTime<Utc>) -> Result<()> {
        self.execute(
            "UPDATE upload_queue
             SET state = $1, not_before = $2, lease_expires_at = NULL, worker_id = NULL
             WHERE id = $3",
            &[
                QueueState::Pending.as_str().into(),
                ts(not_before).into(),
                queue_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Whether any other queue row currently holds this segment inflight.
    pub async fn segment_has_other_inflight(
        &mut self,
        segment_id: &str,
        queue_id: i64,
    ) -> Result<bool> {
        let row = self
            .query_opt(
                "SELECT COUNT(*) FROM upload_queue
                 WHERE segment_id = $1 AND state = $2 AND id <> $3",
                &[
                    segment_id.into(),
                    QueueState::Inflight.as_str().into(),
                    queue_id.into(),
                ],
            )
            .await?;
        Ok(match row {
            Some(row) => row.u64(0)? > 0,
            None => false,
        })
    }

    /// Return expired inflight rows to pending. Runs from the sweeper.
    pub async fn sweep_upload_leases(&mut self) -> Result<u64> {
        self.execute(
            "UPDATE upload_queue
             SET state = $1, lease_expires_at = NULL, worker_id = NULL
             WHERE state = $2 AND lease_expires_at IS NOT NULL AND lease_expires_at < $3",
            &[
                QueueState::Pending.as_str().into(),
                QueueState::Inflight.as_str().into(),
                ts(Utc::now()).into(),
            ],
        )
        .await
    }

    /// Remove every queue row of a terminal session. Resuming cancelled
    /// work happens through a fresh session re-enqueuing from segment
    /// states, never through leftover rows.
    pub async fn purge_session_uploads(&mut self, session_id: &str) -> Result<u64> {
        self.execute(
            "DELETE FROM upload_queue WHERE session_id = $1",
            &[session_id.into()],
        )
        .await
    }

    pub async fn upload_queue_depth(&mut self, session_id: &str) -> Result<u64> {
        let row = self
            .query_opt(
                "SELECT COUNT(*) FROM upload_queue WHERE session_id = $1",
                &[session_id.into()],
            )
            .await?;
        match row {
            Some(row) => row.u64(0),
            None => Ok(0),
        }
    }

    pub async fn enqueue_download(
        &mut self,
        session_id: &str,
        plan_key: &str,
        plan_blob: &[u8],
    ) -> Result<()> {
        self.execute(
            "INSERT INTO download_queue (session_id, plan_key, plan_blob, state, not_before)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                session_id.into(),
                plan_key.into(),
                plan_blob.into(),
                QueueState::Pending.as_str().into(),
                ts(Utc::now()).into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn claim_download(
        &mut self,
        session_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<DownloadQueueRow>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE download_queue
             SET state = $1, worker_id = $2, lease_expires_at = $3
             WHERE id = (
                 SELECT id FROM download_queue
                 WHERE session_id = $4 AND state = $5 AND not_before <= $6
                 ORDER BY id
                 LIMIT 1
             )
             RETURNING {}",
            DOWNLOAD_COLUMNS
        );
        let rows = self
            .query(
                &sql,
                &[
                    QueueState::Inflight.as_str().into(),
                    worker_id.into(),
                    ts(now + lease).into(),
                    session_id.into(),
                    QueueState::Pending.as_str().into(),
                    ts(now).into(),
                ],
            )
            .await?;
        rows.first().map(download_from_row).transpose()
    }

    /// Download outcomes survive as rows so a restart can enumerate what
    /// is already verified.
    pub async fn set_download_outcome(
        &mut self,
        queue_id: i64,
        state: QueueState,
    ) -> Result<()> {
        self.execute(
            "UPDATE download_queue
             SET state = $1, lease_expires_at = NULL, worker_id = NULL
             WHERE id = $2",
            &[state.as_str().into(), queue_id.into()],
        )
        .await?;
        Ok(())
    }

    pub async fn reschedule_download(
        &mut self,
        queue_id: i64,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(
            "UPDATE download_queue
             SET state = $1, retry_count = retry_count + 1, not_before = $2,
                 lease_expires_at = NULL, worker_id = NULL
             WHERE id = $3",
            &[
                QueueState::Pending.as_str().into(),
                ts(not_before).into(),
                queue_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn sweep_download_leases(&mut self) -> Result<u64> {
        self.execute(
            "UPDATE download_queue
             SET state = $1, lease_expires_at = NULL, worker_id = NULL
             WHERE state = $2 AND lease_expires_at IS NOT NULL AND lease_expires_at < $3",
            &[
                QueueState::Pending.as_str().into(),
                QueueState::Inflight.as_str().into(),
                ts(Utc::now()).into(),
            ],
        )
        .await
    }

    /// Plan keys already verified for this share + destination across any
    /// prior session; these segments are skipped on resume.
    pub async fn verified_plan_keys(
        &mut self,
        share_id: &str,
        destination: &str,
    ) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT q.plan_key FROM download_queue q
                 JOIN download_sessions s ON q.session_id = s.session_id
                 WHERE s.subject_id = $1 AND s.destination = $2 AND q.state = $3",
                &[
                    share_id.into(),
                    destination.into(),
                    QueueState::Verified.as_str().into(),
                ],
            )
            .await?;
        rows.iter()
            .map(|row| Ok(row.text(0)?.to_string()))
            .collect()
    }

    pub async fn pending_download_count(&mut self, session_id: &str) -> Result<u64> {
        let row = self
            .query_opt(
                "SELECT COUNT(*) FROM download_queue
                 WHERE session_id = $1 AND state IN ($2, $3)",
                &[
                    session_id.into(),
                    QueueState::Pending.as_str().into(),
                    QueueState::Inflight.as_str().into(),
                ],
            )
            .await?;
        match row {
            Some(row) => row.u64(0),
            None => Ok(0),
        }
    }
}
