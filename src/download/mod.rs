//! Download engine
//!
//! Takes a decrypted core index and reconstructs the folder on disk.
//! Workers claim plan rows from the durable download queue, retrieve each
//! segment with redundancy fallback (primary copy first, then each unique
//! copy in order), decrypt, verify the plaintext hash, and hand ranges to
//! per-file writer tasks. Files build in `.partial` form and rename into
//! place only after the file-level hash verifies. Outcomes are durable, so
//! a restarted session skips everything already verified.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::WorkersSection;
use crate::crypto::aead;
use crate::publish::index::{CoreIndex, IndexSegment, SegmentTarget};
use crate::store::Store;
use crate::types::{FileKind, QueueState, Session, SessionKind, SessionStatus};
use crate::wire::WireClient;
use crate::{Error, Result};

const LEASE: chrono::Duration = chrono::Duration::seconds(60);
const MAX_ROW_RETRIES: u32 = 5;

pub struct DownloadEngine {
    store: Store,
    wire: Arc<WireClient>,
    config: WorkersSection,
}

/// Shared reconstruction state: per-file expectations and pending keys.
struct Reconstruction {
    destination: PathBuf,
    /// relative path → (size, content hash).
    expectations: HashMap<String, (u64, String)>,
    /// relative path → plan keys still outstanding.
    remaining: Mutex<HashMap<String, HashSet<String>>>,
    writers: Mutex<HashMap<String, FileWriter>>,
    failed_files: Mutex<Vec<String>>,
}

enum WriteCmd {
    Write {
        offset: u64,
        bytes: Vec<u8>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
}

struct FileWriter {
    sender: mpsc::Sender<WriteCmd>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl DownloadEngine {
    pub fn new(store: Store, wire: Arc<WireClient>, config: WorkersSection) -> Self {
        Self {
            store,
            wire,
            config,
        }
    }

    /// Reconstruct `index` into `destination`, recording progress on
    /// `session`. Returns when the session is terminal.
    pub async fn run(
        &self,
        session: &Session,
        index: &CoreIndex,
        content_key: [u8; 32],
        destination: &Path,
    ) -> Result<()> {
        let session_id = session.session_id.clone();
        tokio::fs::create_dir_all(destination).await?;

        // Directories (including empty ones) and zero-byte files exist
        // before any segment lands.
        for file in &index.files {
            let target = destination.join(&file.relative_path);
            match file.kind {
                FileKind::Directory => {
                    tokio::fs::create_dir_all(&target).await?;
                }
                FileKind::File => {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        // Resume: skip plan keys verified by any prior session for this
        // share + destination.
        let verified_prior: HashSet<String> = {
            let mut tx = self.store.begin().await?;
            let keys = tx
                .verified_plan_keys(&session.subject_id, &destination.to_string_lossy())
                .await?;
            tx.rollback().await?;
            keys.into_iter().collect()
        };

        let todo: Vec<&IndexSegment> = index
            .segments
            .iter()
            .filter(|segment| !verified_prior.contains(&segment.key))
            .collect();

        let total_bytes: u64 = todo.iter().map(|s| s.length).sum();
        {
            let mut tx = self.store.begin().await?;
            tx.set_session_totals(
                SessionKind::Download,
                &session_id,
                todo.len() as u64,
                total_bytes,
            )
            .await?;
            for segment in &todo {
                let blob = rmp_serde::to_vec(segment)
                    .map_err(|e| Error::storage(format!("plan encode: {}", e)))?;
                tx.enqueue_download(&session_id, &segment.key, &blob).await?;
            }
            tx.commit().await?;
        }

        // Per-file bookkeeping for completion detection.
        let mut remaining: HashMap<String, HashSet<String>> = HashMap::new();
        for segment in &index.segments {
            let outstanding = !verified_prior.contains(&segment.key);
            for path in target_paths(&segment.target) {
                let entry = remaining.entry(path).or_default();
                if outstanding {
                    entry.insert(segment.key.clone());
                }
            }
        }
        let expectations: HashMap<String, (u64, String)> = index
            .files
            .iter()
            .filter(|f| f.kind == FileKind::File)
            .map(|f| (f.relative_path.clone(), (f.size, f.content_hash.clone())))
            .collect();

        let reconstruction = Arc::new(Reconstruction {
            destination: destination.to_path_buf(),
            expectations,
            remaining: Mutex::new(remaining),
            writers: Mutex::new(HashMap::new()),
            failed_files: Mutex::new(Vec::new()),
        });

        // Files whose segments were all verified previously (or that have
        // none at all) finalize straight away.
        let ready: Vec<String> = {
            let remaining = reconstruction.remaining.lock().await;
            reconstruction
                .expectations
                .keys()
                .filter(|path| {
                    remaining
                        .get(*path)
                        .map(|keys| keys.is_empty())
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };
        for path in ready {
            reconstruction.finalize_file(&path).await?;
        }

        let sweeper = self.spawn_sweeper();

        let mut workers = tokio::task::JoinSet::new();
        for worker_index in 0..self.config.download.max(1) {
            let worker = Worker {
                store: self.store.clone(),
                wire: Arc::clone(&self.wire),
                session_id: session_id.clone(),
                content_key,
                reconstruction: Arc::clone(&reconstruction),
                worker_id: format!("download-{}", worker_index),
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
                        let mut tx = self.store.begin().await?;
                        tx.cancel_session(SessionKind::Download, &session_id).await?;
                        tx.commit().await?;
                    }
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(Error::storage(format!("download worker panicked: {}", e)));
                    }
                }
            }
        }
        sweeper.abort();
        reconstruction.shutdown_writers().await;

        let failed_files = reconstruction.failed_files.lock().await.clone();

        let mut tx = self.store.begin().await?;
        let current = tx
            .get_session(SessionKind::Download, &session_id)
            .await?
            .ok_or_else(|| Error::storage("download session vanished"))?;
        match (&fatal, current.status) {
            (Some(e), _) => {
                tx.finish_session(
                    SessionKind::Download,
                    &session_id,
                    SessionStatus::Failed,
                    Some(e),
                )
                .await?;
            }
            (None, SessionStatus::Cancelled) => {}
            (None, _) => {
                let ok = current.failed_count == 0 && failed_files.is_empty();
                let status = if ok {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
                let error = (!ok).then(|| {
                    Error::integrity(format!(
                        "{} segments and {} files failed verification",
                        current.failed_count,
                        failed_files.len()
                    ))
                });
                tx.finish_session(SessionKind::Download, &session_id, status, error.as_ref())
                    .await?;
            }
        }
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
                tokio::time::sleep(crate::upload::SWEEP_INTERVAL).await;
                let swept = async {
                    let mut tx = store.begin().await?;
                    let n = tx.sweep_download_leases().await?;
                    tx.commit().await?;
                    Ok::<u64, Error>(n)
                }
                .await;
                if let Err(e) = swept {
                    tracing::warn!("download lease sweep failed: {}", e);
                }
            }
        })
    }
}

fn target_paths(target: &SegmentTarget) -> Vec<String> {
    match target {
        SegmentTarget::Stream { relative_path, .. } => vec![relative_path.clone()],
        SegmentTarget::Pack { members } => members
            .iter()
            .map(|member| member.relative_path.clone())
            .collect(),
    }
}

impl Reconstruction {
    fn partial_path(&self, relative: &str) -> PathBuf {
        self.destination.join(format!("{}.partial", relative))
    }

    fn final_path(&self, relative: &str) -> PathBuf {
        self.destination.join(relative)
    }

    /// Serialize a range write through the file's writer task.
    async fn write_range(&self, relative: &str, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let sender = {
            let mut writers = self.writers.lock().await;
            if !writers.contains_key(relative) {
                let path = self.partial_path(relative);
                let (sender, mut receiver) = mpsc::channel::<WriteCmd>(16);
                let handle = tokio::spawn(async move {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let mut file = tokio::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&path)
                        .await?;
                    while let Some(cmd) = receiver.recv().await {
                        match cmd {
                            WriteCmd::Write { offset, bytes } => {
                                file.seek(std::io::SeekFrom::Start(offset)).await?;
                                file.write_all(&bytes).await?;
                            }
                            WriteCmd::Flush { reply } => {
                                let result = file.flush().await.map_err(Error::from);
                                let _ = reply.send(result);
                            }
                        }
                    }
                    file.flush().await?;
                    Ok::<(), Error>(())
                });
                writers.insert(relative.to_string(), FileWriter { sender, handle });
            }
            writers
                .get(relative)
                .map(|writer| writer.sender.clone())
                .expect("writer just inserted")
        };

        sender
            .send(WriteCmd::Write { offset, bytes })
            .await
            .map_err(|_| Error::storage(format!("writer for {} is gone", relative)))?;
        Ok(())
    }

    /// Record a verified segment and finalize any file it completed.
    async fn segment_verified(&self, key: &str, target: &SegmentTarget) -> Result<()> {
        let completed: Vec<String> = {
            let mut remaining = self.remaining.lock().await;
            let mut done = Vec::new();
            for path in target_paths(target) {
                if let Some(keys) = remaining.get_mut(&path) {
                    keys.remove(key);
                    if keys.is_empty() {
                        done.push(path);
                    }
                }
            }
            done
        };
        for path in completed {
            self.finalize_file(&path).await?;
        }
        Ok(())
    }

    /// Flush and close the writer, verify the file hash, and rename the
    /// `.partial` into place. A mismatch keeps the partial bytes for
    /// diagnosis and records the file as failed.
    async fn finalize_file(&self, relative: &str) -> Result<()> {
        let Some((size, expected_hash)) = self.expectations.get(relative) else {
            return Ok(());
        };

        if let Some(writer) = self.writers.lock().await.remove(relative) {
            let (reply, done) = oneshot::channel();
            let _ = writer.sender.send(WriteCmd::Flush { reply }).await;
            let _ = done.await;
            drop(writer.sender);
            match writer.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::storage(format!("writer task failed: {}", e))),
            }
        }

        let final_path = self.final_path(relative);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            // Already reconstructed by an earlier run.
            return Ok(());
        }

        let partial = self.partial_path(relative);
        if *size == 0 {
            tokio::fs::write(&final_path, b"").await?;
            let _ = tokio::fs::remove_file(&partial).await;
            return Ok(());
        }

        let bytes = tokio::fs::read(&partial).await?;
        let actual_hash = hex::encode(Sha256::digest(&bytes));
        if bytes.len() as u64 != *size || actual_hash != *expected_hash {
            tracing::warn!(
                file = relative,
                "reconstructed file failed verification; keeping partial"
            );
            self.failed_files.lock().await.push(relative.to_string());
            return Ok(());
        }

        tokio::fs::rename(&partial, &final_path).await?;
        Ok(())
    }

    async fn shutdown_writers(&self) {
        let mut writers = self.writers.lock().await;
        for (_, writer) in writers.drain() {
            drop(writer.sender);
            let _ = writer.handle.await;
        }
    }
}

struct Worker {
    store: Store,
    wire: Arc<WireClient>,
    session_id: String,
    content_key: [u8; 32],
    reconstruction: Arc<Reconstruction>,
    worker_id: String,
}

impl Worker {
    async fn run(&self) -> Result<()> {
        loop {
            let status = self.session_status().await?;
            if status.is_terminal() {
                return Ok(());
            }

            let claimed = {
                let mut tx = self.store.begin().await?;
                let row = tx
                    .claim_download(&self.session_id, &self.worker_id, LEASE)
                    .await?;
                tx.commit().await?;
                row
            };
            let Some(row) = claimed else {
                let pending = {
                    let mut tx = self.store.begin().await?;
                    let n = tx.pending_download_count(&self.session_id).await?;
                    tx.rollback().await?;
                    n
                };
                if pending == 0 {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            let segment: IndexSegment = rmp_serde::from_slice(&row.plan_blob)
                .map_err(|e| Error::storage(format!("plan decode: {}", e)))?;

            match self.fetch_with_fallback(&segment).await {
                Ok(plaintext) => {
                    let bytes = plaintext.len() as u64;
                    self.dispatch_writes(&segment, plaintext).await?;
                    let mut tx = self.store.begin().await?;
                    tx.set_download_outcome(row.queue_id, QueueState::Verified)
                        .await?;
                    tx.bump_session_progress(
                        SessionKind::Download,
                        &self.session_id,
                        1,
                        0,
                        bytes,
                    )
                    .await?;
                    tx.commit().await?;
                    self.reconstruction
                        .segment_verified(&segment.key, &segment.target)
                        .await?;
                }
                Err(e) if e.is_transient() && row.retry_count < MAX_ROW_RETRIES => {
                    let delay =
                        crate::wire::retry::backoff_delay(row.retry_count, 500, 30_000);
                    let mut tx = self.store.begin().await?;
                    tx.reschedule_download(
                        row.queue_id,
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(LEASE),
                    )
                    .await?;
                    tx.commit().await?;
                }
                Err(e) => {
                    // Every copy failed; the session continues without
                    // this segment.
                    tracing::warn!(key = %segment.key, "segment unrecoverable: {}", e);
                    let mut tx = self.store.begin().await?;
                    tx.set_download_outcome(row.queue_id, QueueState::Failed)
                        .await?;
                    tx.bump_session_progress(SessionKind::Download, &self.session_id, 0, 1, 0)
                        .await?;
                    tx.append_session_event(
                        SessionKind::Download,
                        &self.session_id,
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
            .get_session(SessionKind::Download, &self.session_id)
            .await?
            .ok_or_else(|| Error::storage("download session vanished"))?;
        tx.rollback().await?;
        Ok(session.status)
    }

    /// Try redundancy copies in order. Not-found and integrity failures
    /// advance to the next copy; only when every copy is exhausted does
    /// the error surface.
    async fn fetch_with_fallback(&self, segment: &IndexSegment) -> Result<Vec<u8>> {
        let mut last_error = Error::NotFound("segment has no copies".to_string());
        for (copy_index, article_ref) in segment.copies.iter().enumerate() {
            let attempt = async {
                let ciphertext = self.wire.fetch_segment(article_ref).await?;
                let plaintext = aead::open(
                    &self.content_key,
                    &ciphertext,
                    segment.internal_subject.as_bytes(),
                )?;
                let actual = hex::encode(Sha256::digest(&plaintext));
                if actual != segment.content_hash {
                    return Err(Error::integrity(format!(
                        "segment {} content hash mismatch",
                        segment.key
                    )));
                }
                Ok::<_, Error>(plaintext)
            }
            .await;

            match attempt {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) if matches!(e, Error::NotFound(_) | Error::Integrity(_)) => {
                    tracing::debug!(
                        key = %segment.key,
                        copy = copy_index,
                        "copy failed, falling back: {}",
                        e
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn dispatch_writes(&self, segment: &IndexSegment, plaintext: Vec<u8>) -> Result<()> {
        match &segment.target {
            SegmentTarget::Stream {
                relative_path,
                offset,
            } => {
                self.reconstruction
                    .write_range(relative_path, *offset, plaintext)
                    .await
            }
            SegmentTarget::Pack { members } => {
                for member in members {
                    let start = member.offset_in_pack as usize;
                    let end = start + member.length as usize;
                    let slice = plaintext
                        .get(start..end)
                        .ok_or_else(|| {
                            Error::integrity(format!(
                                "pack member {} out of range",
                                member.relative_path
                            ))
                        })?
                        .to_vec();
                    self.reconstruction
                        .write_range(&member.relative_path, 0, slice)
                        .await?;
                }
                Ok(())
            }
        }
    }
}
