//! Segment and pack repositories

use super::backend::{Row, Value};
use super::Tx;
use crate::types::{Pack, PackMember, Segment, SegmentOwner, SegmentState};
use crate::{Error, Result};

const BATCH: usize = 1000;

const SEGMENT_COLUMNS: &str = "segment_id, folder_id, version, owner_kind, owner_id,
    segment_index, redundancy_index, offset_bytes, length_bytes, content_hash, payload_hash,
    article_ref_enc, posted_subject, internal_subject, state, retry_count";

fn segment_from_row(row: &Row) -> Result<Segment> {
    let owner_id = row.text(4)?.to_string();
    let owner = match row.text(3)? {
        "file" => SegmentOwner::File(owner_id),
        "pack" => SegmentOwner::Pack(owner_id),
        other => return Err(Error::storage(format!("unknown segment owner kind: {}", other))),
    };
    Ok(Segment {
        segment_id: row.text(0)?.to_string(),
        folder_id: row.text(1)?.to_string(),
        version: row.u64(2)?,
        owner,
        segment_index: row.u32(5)?,
        redundancy_index: row.u32(6)?,
        offset: row.u64(7)?,
        length: row.u64(8)?,
        content_hash: row.text(9)?.to_string(),
        payload_hash: row.text(10)?.to_string(),
        article_ref_enc: row.opt_blob(11)?.map(<[u8]>::to_vec),
        posted_subject: row.text(12)?.to_string(),
        internal_subject: row.text(13)?.to_string(),
        state: SegmentState::parse(row.text(14)?)?,
        retry_count: row.u32(15)?,
    })
}

fn owner_parts(owner: &SegmentOwner) -> (&'static str, &str) {
    match owner {
        SegmentOwner::File(id) => ("file", id),
        SegmentOwner::Pack(id) => ("pack", id),
    }
}

impl Tx<'_> {
    pub async fn insert_segments(&mut self, segments: &[Segment]) -> Result<()> {
        for batch in segments.chunks(BATCH) {
            for segment in batch {
                let (owner_kind, owner_id) = owner_parts(&segment.owner);
                let params: Vec<Value> = vec![
                    segment.segment_id.as_str().into(),
                    segment.folder_id.as_str().into(),
                    segment.version.into(),
                    owner_kind.into(),
                    owner_id.into(),
                    segment.segment_index.into(),
                    segment.redundancy_index.into(),
                    segment.offset.into(),
                    segment.length.into(),
                    segment.content_hash.as_str().into(),
                    segment.payload_hash.as_str().into(),
                    segment.article_ref_enc.as_deref().into(),
                    segment.posted_subject.as_str().into(),
                    segment.internal_subject.as_str().into(),
                    segment.state.as_str().into(),
                    segment.retry_count.into(),
                ];
                self.execute(
                    "INSERT INTO segments (segment_id, folder_id, version, owner_kind, owner_id,
                        segment_index, redundancy_index, offset_bytes, length_bytes, content_hash,
                        payload_hash, article_ref_enc, posted_subject, internal_subject, state,
                        retry_count)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
                    &params,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_segment(&mut self, segment_id: &str) -> Result<Option<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments WHERE segment_id = $1",
            SEGMENT_COLUMNS
        );
        match self.query_opt(&sql, &[segment_id.into()]).await? {
            Some(row) => Ok(Some(segment_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn segments_for_folder_version(
        &mut self,
        folder_id: &str,
        version: u64,
    ) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments
             WHERE folder_id = $1 AND version = $2
             ORDER BY owner_id, segment_index, redundancy_index",
            SEGMENT_COLUMNS
        );
        self.query(&sql, &[folder_id.into(), version.into()])
            .await?
            .iter()
            .map(segment_from_row)
            .collect()
    }

    pub async fn segments_for_owner(&mut self, owner_id: &str) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments WHERE owner_id = $1
             ORDER BY segment_index, redundancy_index",
            SEGMENT_COLUMNS
        );
        self.query(&sql, &[owner_id.into()])
            .await?
            .iter()
            .map(segment_from_row)
            .collect()
    }

    /// Claim a segment for posting: pending (or previously failed) moves
    /// to inflight; anything else means another worker owns it or it is
    /// already posted. One winner per segment, even when duplicate queue
    /// rows exist.
    pub async fn try_mark_segment_inflight(&mut self, segment_id: &str) -> Result<bool> {
        let affected = self
            .execute(
                "UPDATE segments SET state = $1
                 WHERE segment_id = $2 AND state IN ($3, $4)",
                &[
                    SegmentState::Inflight.as_str().into(),
                    segment_id.into(),
                    SegmentState::Pending.as_str().into(),
                    SegmentState::Failed.as_str().into(),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Give up an inflight claim after a transient failure.
    pub async fn reset_segment_pending(&mut self, segment_id: &str) -> Result<()> {
        self.execute(
            "UPDATE segments SET state = $1 WHERE segment_id = $2 AND state = $3",
            &[
                SegmentState::Pending.as_str().into(),
                segment_id.into(),
                SegmentState::Inflight.as_str().into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn set_segment_state(
        &mut self,
        segment_id: &str,
        state: SegmentState,
    ) -> Result<()> {
        self.execute(
            "UPDATE segments SET state = $1 WHERE segment_id = $2",
            &[state.as_str().into(), segment_id.into()],
        )
        .await?;
        Ok(())
    }

    /// Record a successful post: encrypted article reference, posted
    /// payload hash, and state in one write, so outcome and reference
    /// commit together.
    pub async fn mark_segment_posted(
        &mut self,
        segment_id: &str,
        article_ref_enc: &[u8],
        payload_hash: &str,
    ) -> Result<()> {
        self.execute(
            "UPDATE segments SET state = $1, article_ref_enc = $2, payload_hash = $3
             WHERE segment_id = $4",
            &[
                SegmentState::Posted.as_str().into(),
                article_ref_enc.into(),
                payload_hash.into(),
                segment_id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn increment_segment_retry(&mut self, segment_id: &str) -> Result<u32> {
        self.execute(
            "UPDATE segments SET retry_count = retry_count + 1 WHERE segment_id = $1",
            &[segment_id.into()],
        )
        .await?;
        let row = self
            .query_opt(
                "SELECT retry_count FROM segments WHERE segment_id = $1",
                &[segment_id.into()],
            )
            .await?
            .ok_or_else(|| Error::storage(format!("unknown segment: {}", segment_id)))?;
        row.u32(0)
    }

    /// Count segments in a state for one folder version (progress totals,
    /// idempotence checks).
    pub async fn count_segments_in_state(
        &mut self,
        folder_id: &str,
        version: u64,
        state: SegmentState,
    ) -> Result<u64> {
        let row = self
            .query_opt(
                "SELECT COUNT(*) FROM segments
                 WHERE folder_id = $1 AND version = $2 AND state = $3",
                &[folder_id.into(), version.into(), state.as_str().into()],
            )
            .await?
            .ok_or_else(|| Error::storage("count query returned no row"))?;
        row.u64(0)
    }

    pub async fn insert_pack(&mut self, pack: &Pack) -> Result<()> {
        self.execute(
            "INSERT INTO packs (pack_id, folder_id, version) VALUES ($1, $2, $3)",
            &[
                pack.pack_id.as_str().into(),
                pack.folder_id.as_str().into(),
                pack.version.into(),
            ],
        )
        .await?;
        for member in &pack.members {
            self.execute(
                "INSERT INTO pack_members (pack_id, file_id, offset_in_pack, length)
                 VALUES ($1, $2, $3, $4)",
                &[
                    pack.pack_id.as_str().into(),
                    member.file_id.as_str().into(),
                    member.offset_in_pack.into(),
                    member.length.into(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    pub async fn get_pack(&mut self, pack_id: &str) -> Result<Option<Pack>> {
        let head = self
            .query_opt(
                "SELECT pack_id, folder_id, version FROM packs WHERE pack_id = $1",
                &[pack_id.into()],
            )
            .await?;
        let Some(head) = head else {
            return Ok(None);
        };
        let members = self
            .query(
                "SELECT file_id, offset_in_pack, length FROM pack_members
                 WHERE pack_id = $1 ORDER BY offset_in_pack",
                &[pack_id.into()],
            )
            .await?
            .iter()
            .map(|row| {
                Ok(PackMember {
                    file_id: row.text(0)?.to_string(),
                    offset_in_pack: row.u64(1)?,
                    length: row.u64(2)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Pack {
            pack_id: head.text(0)?.to_string(),
            folder_id: head.text(1)?.to_string(),
            version: head.u64(2)?,
            members,
        }))
    }
}
