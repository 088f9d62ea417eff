//! Upload engine
//!
//! Drains the durable priority queue through the wire layer. Workers claim
//! one row at a time under a lease, rebuild the segment payload from disk,
//! encrypt, post, and commit the outcome (posted state + encrypted article
//! reference + progress counters) in a single transaction. A sweeper
//! returns expired leases to pending so a crashed worker never orphans
//! work. Backpressure follows the wire layer's server down-weight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::WorkersSection;
use crate::crypto::{aead, CryptoKernel};
use crate::segmenter::load_unit_plaintext;
use crate::store::Store;
use crate::types::{
    Folder, Priority, SegmentState, Session, SessionKind, SessionStatus, UploadQueueRow,
};
use crate::wire::WireClient;
use crate::{Error, Result};

/// Lease granted to a claiming worker.
const LEASE: chrono::Duration = chrono::Duration::seconds(60);

/// Sweeper cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Queue-level retry budget per row, on top of the wire layer's own
/// per-request budget.
const MAX_ROW_RETRIES: u32 = 5;

/// Store-conflict retry budget before surfacing as storage failure.
const CONFLICT_BUDGET: u32 = 3;

pub struct UploadEngine {
    store: Store,
    kernel: Arc<CryptoKernel>,
    wire: Arc<WireClient>,
    config: WorkersSection,
}

impl UploadEngine {
    pub fn new(
        store: Store,
        kernel: Arc<CryptoKernel>,
        wire: Arc<WireClient>,
        config: WorkersSection,
    ) -> Self {
        Self {
            store,
            kernel,
            wire,
            config,
        }
    }

    /// Enqueue every unposted segment of `version` and drive the queue to
    /// empty. Returns when the session reaches a terminal state. Segments
    /// already posted are skipped, so a rerun after a crash posts exactly
    /// the remainder.
    pub async fn run(
        &self,
        folder: &Folder,
        version: u64,
        session: &Session,
        priority: Priority,
    ) -> Result<()> {
        let session_id = session.session_id.clone();

        // Enqueue below the high-water mark; workers drain concurrently.
        let pending: Vec<_> = {
            let mut tx = self.store.begin().await?;
            let segments = tx
                .segments_for_folder_version(&folder.folder_id, version)
                .await?;
            tx.rollback().await?;
            segments
                .into_iter()
                .filter(|s| s.state != SegmentState::Posted)
                .collect()
        };

        let total_bytes: u64 = pending.iter().map(|s| s.length).sum();
        {
            let mut tx = self.store.begin().await?;
            tx.set_session_totals(
                SessionKind::Upload,
                &session_id,
                pending.len() as u64,
                total_bytes,
            )
            .await?;
            tx.commit().await?;
        }

        let sweeper = self.spawn_sweeper();

        for chunk in pending.chunks(500) {
            loop {
                let depth = {
                    let mut tx = self.store.begin().await?;
                    let depth = tx.upload_queue_depth(&session_id).await?;
                    tx.rollback().await?;
                    depth
                };
                if depth < self.config.queue_high_water {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let mut tx = self.store.begin().await?;
            for segment in chunk {
                tx.enqueue_upload(&session_id, &segment.segment_id, priority)
                    .await?;
            }
            tx.commit().await?;
        }

        // Worker pool.
        let mut workers = tokio::task::JoinSet::new();
        for worker_index in 0..self.config.upload.max(1) {
            let worker = Worker {
                store: self.store.clone(),
                kernel: Arc::clone(&self.kernel),
                wire: Arc::clone(&self.wire),
                folder: folder.clone(),
                version,
                session_id: session_id.clone(),
                worker_id: format!("upload-{}", worker_index),
            };
            workers.spawn(async move { worker.run().await });
        }

        let mut fatal: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                        // A fatal error cancels the rest of the session.
                        let mut tx = self.store.begin().await?;
                        tx.cancel_session(SessionKind::Upload, &session_id).await?;
                        tx.commit().await?;
                    }
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(Error::storage(format!("upload worker panicked: {}", e)));
                    }
                }
            }
        }
        sweeper.abort();

        let mut tx = self.store.begin().await?;
        let current = tx
            .get_session(SessionKind::Upload, &session_id)
            .await?
            .ok_or_else(|| Error::storage("upload session vanished"))?;
        match (&fatal, current.status) {
            (Some(e), _) => {
                tx.finish_session(
                    SessionKind::Upload,
                    &session_id,
                    SessionStatus::Failed,
                    Some(e),
                )
                .await?;
            }
            (None, SessionStatus::Cancelled) => {}
            (None, _) => {
                let status = if current.failed_count > 0 {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Completed
                };
                let error = (current.failed_count > 0).then(|| {
                    Error::protocol(format!(
                        "{} of {} segments failed permanently",
                        current.failed_count, current.total_count
                    ))
                });
                tx.finish_session(SessionKind::Upload, &session_id, status, error.as_ref())
                    .await?;
            }
        }
        tx.purge_session_uploads(&session_id).await?;
        tx.commit().await?;

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let swept = async {
                    let mut tx = store.begin().await?;
                    let n = tx.sweep_upload_leases().await?;
                    tx.commit().await?;
                    Ok::<u64, Error>(n)
                }
                .await;
                match swept {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(recovered = n, "returned expired upload leases"),
                    Err(e) => tracing::warn!("lease sweep failed: {}", e),
                }
            }
        })
    }
}

struct Worker {
    store: Store,
    kernel: Arc<CryptoKernel>,
    wire: Arc<WireClient>,
    folder: Folder,
    version: u64,
    session_id: String,
    worker_id: String,
}

impl Worker {
    async fn run(&self) -> Result<()> {
        loop {
            // Cancellation is observed between iterations.
            let status = self.session_status().await?;
            if status.is_terminal() {
                return Ok(());
            }

            // Back off while the server is down-weighted.
            let weight = self.wire.down_weight();
            if weight > 0.0 {
                let sleep_ms = (weight * 2_000.0) as u64 + fastrand::u64(0..250);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }

            let claimed = self.claim_with_conflict_budget().await?;
            let Some(row) = claimed else {
                let depth = {
                    let mut tx = self.store.begin().await?;
                    let depth = tx.upload_queue_depth(&self.session_id).await?;
                    tx.rollback().await?;
                    depth
                };
                if depth == 0 {
                    return Ok(());
                }
                // Rows exist but are inflight elsewhere or scheduled later.
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            match self.post_one(&row).await {
                Ok(PostResult::Posted(bytes)) => {
                    // Outcome commits only after the post succeeded.
                    let mut tx = self.store.begin().await?;
                    tx.complete_upload(row.queue_id).await?;
                    tx.bump_session_progress(SessionKind::Upload, &row.session_id, 1, 0, bytes)
                        .await?;
                    tx.commit().await?;
                }
                Ok(PostResult::AlreadyPosted) => {
                    let mut tx = self.store.begin().await?;
                    tx.complete_upload(row.queue_id).await?;
                    tx.bump_session_progress(SessionKind::Upload, &row.session_id, 1, 0, 0)
                        .await?;
                    tx.commit().await?;
                }
                Ok(PostResult::Busy) => {
                    // Another worker holds the segment; check back shortly
                    // without spending the retry budget.
                    let mut tx = self.store.begin().await?;
                    tx.delay_upload(row.queue_id, Utc::now() + chrono::Duration::milliseconds(250))
                        .await?;
                    tx.commit().await?;
                }
                Err(e) if matches!(e, Error::Auth(_)) => {
                    // Abort the whole session.
                    return Err(e);
                }
                Err(e) if matches!(e, Error::Integrity(_) | Error::Crypto(_)) => {
                    return Err(e);
                }
                Err(e) if e.is_transient() && row.retry_count < MAX_ROW_RETRIES => {
                    let delay = crate::wire::retry::backoff_delay(row.retry_count, 500, 30_000);
                    let mut tx = self.store.begin().await?;
                    tx.reset_segment_pending(&row.segment_id).await?;
                    tx.reschedule_upload(
                        row.queue_id,
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(LEASE),
                    )
                    .await?;
                    tx.increment_segment_retry(&row.segment_id).await?;
                    tx.append_session_event(
                        SessionKind::Upload,
                        &row.session_id,
                        "retry",
                        &format!("segment rescheduled after: {}", e),
                    )
                    .await?;
                    tx.commit().await?;
                }
                Err(e) => {
                    tracing::warn!(segment = %row.segment_id, "segment failed permanently: {}", e);
                    let mut tx = self.store.begin().await?;
                    tx.drop_upload(row.queue_id).await?;
                    tx.set_segment_state(&row.segment_id, SegmentState::Failed)
                        .await?;
                    tx.bump_session_progress(SessionKind::Upload, &row.session_id, 0, 1, 0)
                        .await?;
                    tx.append_session_event(
                        SessionKind::Upload,
                        &row.session_id,
                        "segment_failed",
                        &e.to_string(),
                    )
                    .await?;
                    tx.commit().await?;
                }
            }
        }
    }

    async fn session_status(&self) -> Result<SessionStatus> {
        let mut tx = self.store.begin().await?;
        let session = tx
            .get_session(SessionKind::Upload, &self.session_id)
            .await?
            .ok_or_else(|| Error::storage("upload session vanished"))?;
        tx.rollback().await?;
        Ok(session.status)
    }

    async fn claim_with_conflict_budget(&self) -> Result<Option<UploadQueueRow>> {
        let mut conflicts = 0u32;
        loop {
            let attempt = async {
                let mut tx = self.store.begin().await?;
                let claimed = tx.claim_upload(&self.worker_id, LEASE).await?;
                tx.commit().await?;
                Ok::<_, Error>(claimed)
            }
            .await;
            match attempt {
                Ok(row) => return Ok(row),
                Err(Error::Conflict(_)) if conflicts < CONFLICT_BUDGET => {
                    conflicts += 1;
                    tokio::time::sleep(Duration::from_millis(
                        10 * (1 << conflicts) + fastrand::u64(0..10),
                    ))
                    .await;
                }
                Err(Error::Conflict(detail)) => {
                    return Err(Error::storage(format!(
                        "claim conflict budget exhausted: {}",
                        detail
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Rebuild, encrypt, and post one segment copy.
    async fn post_one(&self, row: &UploadQueueRow) -> Result<PostResult> {
        // Claim the segment itself, not just the queue row: duplicate rows
        // can exist after an interrupted session, and exactly one article
        // may be posted per (segment, redundancy) pair.
        let segment = {
            let mut tx = self.store.begin().await?;
            let segment = tx
                .get_segment(&row.segment_id)
                .await?
                .ok_or_else(|| Error::storage(format!("unknown segment: {}", row.segment_id)))?;
            if segment.state == SegmentState::Posted {
                tx.rollback().await?;
                return Ok(PostResult::AlreadyPosted);
            }
            if !tx.try_mark_segment_inflight(&row.segment_id).await? {
                // Inflight already: either a live worker owns it, or a
                // previous process died mid-post and left it stale.
                let stale = !tx
                    .segment_has_other_inflight(&row.segment_id, row.queue_id)
                    .await?;
                if stale {
                    tx.set_segment_state(&row.segment_id, SegmentState::Inflight)
                        .await?;
                } else {
                    tx.rollback().await?;
                    return Ok(PostResult::Busy);
                }
            }
            tx.commit().await?;
            segment
        };

        let plaintext = load_unit_plaintext(&self.store, &self.folder.path, &segment).await?;
        let actual_hash = hex::encode(Sha256::digest(&plaintext));
        if actual_hash != segment.content_hash {
            return Err(Error::integrity(format!(
                "segment {} plaintext changed since segmentation",
                segment.segment_id
            )));
        }

        let key = self
            .kernel
            .content_key(&self.folder.folder_id, self.version);
        let ciphertext = aead::seal(&key, &plaintext, segment.internal_subject.as_bytes())?;
        let payload_hash = hex::encode(Sha256::digest(&ciphertext));

        let article_ref = self
            .wire
            .post_segment(&segment.posted_subject, &ciphertext)
            .await?;

        let encoded = rmp_serde::to_vec(&article_ref)
            .map_err(|e| Error::storage(format!("article ref encode: {}", e)))?;
        let sealed_ref = self.kernel.seal_at_rest(&encoded)?;

        let mut tx = self.store.begin().await?;
        tx.mark_segment_posted(&segment.segment_id, &sealed_ref, &payload_hash)
            .await?;
        tx.commit().await?;

        Ok(PostResult::Posted(ciphertext.len() as u64))
    }
}

/// Outcome of one posting attempt from a claimed queue row.
enum PostResult {
    /// Freshly posted; carries the ciphertext byte count.
    Posted(u64),
    /// A prior run already posted this copy; the row is simply done.
    AlreadyPosted,
    /// Another worker owns the segment right now.
    Busy,
}
