//! Segmenter
//!
//! Turns the staging set of one folder version into segment and pack rows.
//! Small files pack together (first-fit-decreasing, never straddling);
//! larger files split into consecutive ranges of exactly the target size.
//! Each logical unit gets a deterministic internal subject shared by its
//! redundancy copies and a fresh posted subject per copy; ciphertext is
//! produced at posting time so a resumed upload regenerates it from disk.

pub mod packer;

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::SegmentSection;
use crate::crypto::{keys::FolderKeys, obfuscate, CryptoKernel};
use crate::store::Store;
use crate::types::{
    new_entity_id, FileEntry, FileKind, Folder, Pack, PackMember, Segment, SegmentOwner,
    SegmentState,
};
use crate::{Error, Result};

use packer::{first_fit_decreasing, PackInput, PlannedPack};

/// Summary of one segmentation run.
#[derive(Debug, Clone, Default)]
pub struct SegmentationOutcome {
    /// Logical units (packs + stream ranges), before redundancy fan-out.
    pub logical_segments: u64,
    /// Rows written, including redundancy copies.
    pub segment_rows: u64,
    pub packs: u64,
    pub staged_files: u64,
    pub staged_bytes: u64,
}

/// A hashed plaintext unit produced by the blocking scan phase.
#[derive(Debug)]
struct UnitDraft {
    owner: SegmentOwner,
    segment_index: u32,
    offset: u64,
    length: u64,
    content_hash: String,
}

pub struct Segmenter {
    store: Store,
    kernel: Arc<CryptoKernel>,
    config: SegmentSection,
}

impl Segmenter {
    pub fn new(store: Store, kernel: Arc<CryptoKernel>, config: SegmentSection) -> Self {
        Self {
            store,
            kernel,
            config,
        }
    }

    /// Segment the staging set of `version`. Calling again on an
    /// already-segmented version is a no-op returning the existing counts.
    pub async fn segment_folder(
        &self,
        folder: &Folder,
        version: u64,
    ) -> Result<SegmentationOutcome> {
        let mut tx = self.store.begin().await?;

        let existing = tx
            .segments_for_folder_version(&folder.folder_id, version)
            .await?;
        if !existing.is_empty() {
            let logical = existing
                .iter()
                .filter(|s| s.redundancy_index == 0)
                .count() as u64;
            tx.rollback().await?;
            return Ok(SegmentationOutcome {
                logical_segments: logical,
                segment_rows: existing.len() as u64,
                ..Default::default()
            });
        }

        let staged: Vec<FileEntry> = tx
            .files_first_seen_at(&folder.folder_id, version)
            .await?
            .into_iter()
            .filter(|entry| {
                entry.kind == FileKind::File && entry.error.is_none() && entry.size > 0
            })
            .collect();

        let keys = FolderKeys::unseal(&self.kernel, &folder.private_key_enc)?;

        let segment_size = self.config.size_bytes;
        let threshold = self.config.pack_threshold_bytes;

        let (pack_candidates, stream_set): (Vec<&FileEntry>, Vec<&FileEntry>) =
            staged.iter().partition(|entry| entry.size <= threshold);

        let planned_packs = first_fit_decreasing(
            pack_candidates
                .iter()
                .map(|entry| PackInput {
                    file_id: entry.file_id.clone(),
                    relative_path: entry.relative_path.clone(),
                    size: entry.size,
                })
                .collect(),
            segment_size,
        );

        // Hash all plaintext units on a blocking task; only hashes come
        // back, never payloads.
        let root = PathBuf::from(&folder.path);
        let stream_specs: Vec<(String, String, u64)> = stream_set
            .iter()
            .map(|entry| {
                (
                    entry.file_id.clone(),
                    entry.relative_path.clone(),
                    entry.size,
                )
            })
            .collect();
        let packs_for_scan = planned_packs.clone();
        let (pack_drafts, stream_drafts) = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || {
                let packs = hash_pack_units(&root, &packs_for_scan)?;
                let streams = hash_stream_units(&root, &stream_specs, segment_size)?;
                Ok::<_, Error>((packs, streams))
            })
            .await
            .map_err(|e| Error::storage(format!("segmentation task failed: {}", e)))??
        };

        let mut outcome = SegmentationOutcome {
            staged_files: staged.len() as u64,
            staged_bytes: staged.iter().map(|e| e.size).sum(),
            ..Default::default()
        };

        // Persist packs with their member tables.
        let mut pack_rows = Vec::new();
        for (planned, draft) in planned_packs.iter().zip(&pack_drafts) {
            let SegmentOwner::Pack(pack_id) = &draft.owner else {
                return Err(Error::storage("pack draft with non-pack owner"));
            };
            pack_rows.push(Pack {
                pack_id: pack_id.clone(),
                folder_id: folder.folder_id.clone(),
                version,
                members: planned
                    .members
                    .iter()
                    .map(|member| PackMember {
                        file_id: member.file_id.clone(),
                        offset_in_pack: member.offset_in_pack,
                        length: member.length,
                    })
                    .collect(),
            });
        }
        for pack in &pack_rows {
            tx.insert_pack(pack).await?;
        }
        outcome.packs = pack_rows.len() as u64;

        // Fan each logical unit out into redundancy copies. Copies share
        // the plaintext range, content hash, and internal subject; every
        // posted field is fresh per copy.
        let mut rows: Vec<Segment> = Vec::new();
        for draft in pack_drafts.iter().chain(stream_drafts.iter()) {
            let internal = obfuscate::internal_subject(
                &keys,
                &folder.folder_id,
                version,
                draft.segment_index,
                draft.content_hash.as_bytes(),
            );
            for redundancy_index in 0..self.config.redundancy {
                rows.push(Segment {
                    segment_id: new_entity_id(),
                    folder_id: folder.folder_id.clone(),
                    version,
                    owner: draft.owner.clone(),
                    segment_index: draft.segment_index,
                    redundancy_index,
                    offset: draft.offset,
                    length: draft.length,
                    content_hash: draft.content_hash.clone(),
                    payload_hash: String::new(),
                    article_ref_enc: None,
                    posted_subject: obfuscate::posted_subject()?,
                    internal_subject: internal.clone(),
                    state: SegmentState::Pending,
                    retry_count: 0,
                });
            }
            outcome.logical_segments += 1;
        }
        tx.insert_segments(&rows).await?;
        outcome.segment_rows = rows.len() as u64;

        let mut stats = folder.stats;
        stats.segment_count = outcome.segment_rows;
        tx.update_folder_stats(&folder.folder_id, stats).await?;

        tx.commit().await?;

        tracing::info!(
            folder = %folder.folder_id,
            version,
            files = outcome.staged_files,
            packs = outcome.packs,
            logical = outcome.logical_segments,
            rows = outcome.segment_rows,
            "segmented folder"
        );
        Ok(outcome)
    }
}

/// Concatenate each planned pack's members and hash the result. Holds at
/// most one pack (≤ segment size) in memory.
fn hash_pack_units(root: &Path, packs: &[PlannedPack]) -> Result<Vec<UnitDraft>> {
    let mut drafts = Vec::with_capacity(packs.len());
    for planned in packs {
        let mut buffer = Vec::with_capacity(planned.total as usize);
        for member in &planned.members {
            let path = root.join(&member.relative_path);
            let mut file = fs::File::open(&path)?;
            let before = buffer.len();
            file.read_to_end(&mut buffer)?;
            let read = (buffer.len() - before) as u64;
            if read != member.length {
                return Err(Error::integrity(format!(
                    "{} changed size during segmentation ({} != {})",
                    member.relative_path, read, member.length
                )));
            }
        }
        drafts.push(UnitDraft {
            owner: SegmentOwner::Pack(new_entity_id()),
            segment_index: 0,
            offset: 0,
            length: buffer.len() as u64,
            content_hash: hex::encode(Sha256::digest(&buffer)),
        });
    }
    Ok(drafts)
}

/// Split each stream-set file into consecutive ranges of exactly
/// `segment_size` bytes (final range possibly shorter) and hash each.
fn hash_stream_units(
    root: &Path,
    files: &[(String, String, u64)],
    segment_size: u64,
) -> Result<Vec<UnitDraft>> {
    let mut drafts = Vec::new();
    for (file_id, relative_path, size) in files {
        let path = root.join(relative_path);
        let mut file = fs::File::open(&path)?;
        let mut remaining = *size;
        let mut offset = 0u64;
        let mut index = 0u32;
        let mut buf = vec![0u8; segment_size as usize];
        file.seek(SeekFrom::Start(0))?;
        while remaining > 0 {
            let want = remaining.min(segment_size) as usize;
            file.read_exact(&mut buf[..want]).map_err(|e| {
                Error::integrity(format!(
                    "{} changed size during segmentation: {}",
                    relative_path, e
                ))
            })?;
            drafts.push(UnitDraft {
                owner: SegmentOwner::File(file_id.clone()),
                segment_index: index,
                offset,
                length: want as u64,
                content_hash: hex::encode(Sha256::digest(&buf[..want])),
            });
            offset += want as u64;
            remaining -= want as u64;
            index += 1;
        }
    }
    Ok(drafts)
}

/// Read one plaintext unit back from disk: a file range, or a pack
/// reassembled from its member table. Used by the upload engine when it
/// builds the article payload for a claimed segment.
pub async fn load_unit_plaintext(
    store: &Store,
    folder_path: &str,
    segment: &Segment,
) -> Result<Vec<u8>> {
    match &segment.owner {
        SegmentOwner::File(file_id) => {
            let mut tx = store.begin().await?;
            let entry = tx
                .get_file(file_id)
                .await?
                .ok_or_else(|| Error::storage(format!("unknown file: {}", file_id)))?;
            tx.rollback().await?;
            let path = PathBuf::from(folder_path).join(&entry.relative_path);
            let offset = segment.offset;
            let length = segment.length as usize;
            tokio::task::spawn_blocking(move || {
                let mut file = fs::File::open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; length];
                file.read_exact(&mut buf)?;
                Ok::<_, Error>(buf)
            })
            .await
            .map_err(|e| Error::storage(format!("read task failed: {}", e)))?
        }
        SegmentOwner::Pack(pack_id) => {
            let mut tx = store.begin().await?;
            let pack = tx
                .get_pack(pack_id)
                .await?
                .ok_or_else(|| Error::storage(format!("unknown pack: {}", pack_id)))?;
            let mut paths = Vec::with_capacity(pack.members.len());
            for member in &pack.members {
                let entry = tx
                    .get_file(&member.file_id)
                    .await?
                    .ok_or_else(|| Error::storage(format!("unknown file: {}", member.file_id)))?;
                paths.push((entry.relative_path, member.length));
            }
            tx.rollback().await?;
            let root = PathBuf::from(folder_path);
            tokio::task::spawn_blocking(move || {
                let mut buffer = Vec::new();
                for (relative_path, length) in paths {
                    let mut file = fs::File::open(root.join(&relative_path))?;
                    let before = buffer.len();
                    file.read_to_end(&mut buffer)?;
                    if (buffer.len() - before) as u64 != length {
                        return Err(Error::integrity(format!(
                            "{} changed size since segmentation",
                            relative_path
                        )));
                    }
                }
                Ok::<_, Error>(buffer)
            })
            .await
            .map_err(|e| Error::storage(format!("read task failed: {}", e)))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexSection;
    use crate::crypto::{kdf::KdfParams, MasterKey};
    use crate::indexer::Indexer;
    use crate::store::tests::open_temp;
    use crate::types::{FolderStats, FolderStatus};
    use chrono::Utc;

    fn test_kernel() -> Arc<CryptoKernel> {
        Arc::new(CryptoKernel::new(MasterKey::from_bytes([7u8; 32]), KdfParams::test()).unwrap())
    }

    async fn setup_indexed(
        files: &[(&str, Vec<u8>)],
    ) -> (tempfile::TempDir, tempfile::TempDir, Store, Folder, Arc<CryptoKernel>) {
        let (store_dir, store) = open_temp().await;
        let data_dir = tempfile::TempDir::new().unwrap();
        for (name, content) in files {
            let path = data_dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        let kernel = test_kernel();
        let keys = FolderKeys::generate();
        let folder = Folder {
            folder_id: "f1".to_string(),
            path: data_dir.path().to_string_lossy().into_owned(),
            version: 1,
            status: FolderStatus::Added,
            public_key: keys.public_bytes().to_vec(),
            private_key_enc: keys.seal(&kernel).unwrap(),
            stats: FolderStats::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_folder(&folder).await.unwrap();
        tx.commit().await.unwrap();

        Indexer::new(store.clone(), IndexSection::default())
            .index_folder(&folder)
            .await
            .unwrap();
        (store_dir, data_dir, store, folder, kernel)
    }

    fn small_config() -> SegmentSection {
        SegmentSection {
            size_bytes: 1000,
            pack_threshold_bytes: 100,
            redundancy: 1,
        }
    }

    #[tokio::test]
    async fn test_small_files_pack_large_files_stream() {
        let (_sd, _dd, store, folder, kernel) = setup_indexed(&[
            ("tiny.txt", b"hello".to_vec()),
            ("small.bin", vec![1u8; 80]),
            ("big.bin", vec![0x41u8; 2500]),
        ])
        .await;

        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        let outcome = segmenter.segment_folder(&folder, 1).await.unwrap();

        // One pack (5 + 80 bytes), three stream ranges (1000+1000+500).
        assert_eq!(outcome.packs, 1);
        assert_eq!(outcome.logical_segments, 4);
        assert_eq!(outcome.segment_rows, 4);

        let mut tx = store.begin().await.unwrap();
        let segments = tx.segments_for_folder_version("f1", 1).await.unwrap();
        let stream: Vec<_> = segments
            .iter()
            .filter(|s| matches!(s.owner, SegmentOwner::File(_)))
            .collect();
        assert_eq!(stream.len(), 3);
        // Primary plaintext lengths sum to the file size.
        let total: u64 = stream.iter().map(|s| s.length).sum();
        assert_eq!(total, 2500);
        assert_eq!(stream[0].length, 1000);
        assert_eq!(stream[2].length, 500);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_boundary_exact_segment_size() {
        let (_sd, _dd, store, folder, kernel) =
            setup_indexed(&[("exact.bin", vec![9u8; 1000])]).await;
        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        let outcome = segmenter.segment_folder(&folder, 1).await.unwrap();
        // Exactly S yields exactly one stream segment, no pack.
        assert_eq!(outcome.packs, 0);
        assert_eq!(outcome.logical_segments, 1);

        let mut tx = store.begin().await.unwrap();
        let segments = tx.segments_for_folder_version("f1", 1).await.unwrap();
        assert_eq!(segments[0].length, 1000);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_boundary_size_plus_one() {
        let (_sd, _dd, store, folder, kernel) =
            setup_indexed(&[("plus.bin", vec![9u8; 1001])]).await;
        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        let outcome = segmenter.segment_folder(&folder, 1).await.unwrap();
        assert_eq!(outcome.logical_segments, 2);

        let mut tx = store.begin().await.unwrap();
        let segments = tx.segments_for_folder_version("f1", 1).await.unwrap();
        let lengths: Vec<u64> = segments.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![1000, 1]);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_byte_file_yields_no_segments() {
        let (_sd, _dd, store, folder, kernel) = setup_indexed(&[("empty", Vec::new())]).await;
        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        let outcome = segmenter.segment_folder(&folder, 1).await.unwrap();
        assert_eq!(outcome.logical_segments, 0);
        assert_eq!(outcome.segment_rows, 0);
    }

    #[tokio::test]
    async fn test_redundancy_copies_share_internal_differ_posted() {
        let (_sd, _dd, store, folder, kernel) =
            setup_indexed(&[("data.bin", vec![5u8; 300])]).await;
        let config = SegmentSection {
            size_bytes: 1000,
            pack_threshold_bytes: 100,
            redundancy: 3,
        };
        let segmenter = Segmenter::new(store.clone(), kernel, config);
        let outcome = segmenter.segment_folder(&folder, 1).await.unwrap();
        assert_eq!(outcome.logical_segments, 1);
        assert_eq!(outcome.segment_rows, 3);

        let mut tx = store.begin().await.unwrap();
        let segments = tx.segments_for_folder_version("f1", 1).await.unwrap();
        assert_eq!(segments.len(), 3);
        let internal: std::collections::HashSet<_> =
            segments.iter().map(|s| s.internal_subject.clone()).collect();
        assert_eq!(internal.len(), 1);
        let posted: std::collections::HashSet<_> =
            segments.iter().map(|s| s.posted_subject.clone()).collect();
        assert_eq!(posted.len(), 3);
        let hashes: std::collections::HashSet<_> =
            segments.iter().map(|s| s.content_hash.clone()).collect();
        assert_eq!(hashes.len(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_resegment_is_noop() {
        let (_sd, _dd, store, folder, kernel) =
            setup_indexed(&[("data.bin", vec![5u8; 300])]).await;
        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        let first = segmenter.segment_folder(&folder, 1).await.unwrap();
        let second = segmenter.segment_folder(&folder, 1).await.unwrap();
        assert_eq!(first.segment_rows, second.segment_rows);
        assert_eq!(second.staged_files, 0);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.segments_for_folder_version("f1", 1).await.unwrap().len(),
            first.segment_rows as usize
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_unit_plaintext_round_trip() {
        let (_sd, _dd, store, folder, kernel) = setup_indexed(&[
            ("tiny.txt", b"hello".to_vec()),
            ("big.bin", vec![0x41u8; 1500]),
        ])
        .await;
        let segmenter = Segmenter::new(store.clone(), kernel, small_config());
        segmenter.segment_folder(&folder, 1).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let segments = tx.segments_for_folder_version("f1", 1).await.unwrap();
        tx.commit().await.unwrap();

        for segment in &segments {
            let plaintext = load_unit_plaintext(&store, &folder.path, segment)
                .await
                .unwrap();
            assert_eq!(plaintext.len() as u64, segment.length);
            assert_eq!(hex::encode(Sha256::digest(&plaintext)), segment.content_hash);
        }
    }
}
