//! Publisher
//!
//! Builds and posts the encrypted core index for an uploaded folder
//! version, mints the share handle, and enforces the three access tiers:
//! PUBLIC embeds the content key in the access string, PRIVATE wraps it
//! per authorized user behind a zero-knowledge commitment, PROTECTED
//! derives it from a password. Share identifiers are pure randomness;
//! tier, folder, and version are recoverable only from the local record.

pub mod index;

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{commit, kdf, obfuscate, CryptoKernel, FolderKeys, KdfParams};
use crate::store::Store;
use crate::types::{
    ArticleRef, Commitment, FileKind, Segment, SegmentOwner, SegmentState, Share, ShareAuth,
    ShareTier, UserId,
};
use crate::wire::WireClient;
use crate::{Error, Result};

use index::{CoreIndex, IndexFile, IndexPackMember, IndexSegment, SegmentTarget};

/// Share ids: 15 bytes of randomness, base32, 24 chars, no prefix.
const SHARE_ID_RAW_LEN: usize = 15;
pub const SHARE_ID_LEN: usize = 24;

/// Access-string envelope version.
const ACCESS_VERSION: u8 = 0x01;

const TIER_TAG_PUBLIC: u8 = 0x01;

/// The one message every fetch-side refusal carries. Unknown ids, revoked
/// or expired shares, mismatched tiers, and wrong credentials must all
/// read identically from outside.
const ACCESS_DENIED: &str = "share access denied";

/// Tier-specific inputs to `publish`.
#[derive(Debug, Clone)]
pub enum TierParams {
    Public,
    Private { authorized_users: Vec<UserId> },
    Protected { password: String },
}

/// Tier-specific inputs to `fetch`.
#[derive(Debug, Clone)]
pub enum AccessParams {
    Public { access_string: String },
    Private { user_id: UserId },
    Protected { password: String },
}

/// Result of a publication.
#[derive(Debug, Clone)]
pub struct Published {
    pub share_id: String,
    /// PUBLIC tier only: the self-contained access string.
    pub access_string: Option<String>,
}

/// Outer wrapper actually posted as the top article. When the sealed
/// index outgrows the segment size, its bytes spread over chunk articles
/// and the top article carries only the reference table.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IndexEnvelope {
    Inline { sealed: index::SealedIndex },
    Chunked { refs: Vec<ArticleRef> },
}

pub struct Publisher {
    store: Store,
    kernel: Arc<CryptoKernel>,
    wire: Arc<WireClient>,
    segment_size: u64,
}

impl Publisher {
    pub fn new(
        store: Store,
        kernel: Arc<CryptoKernel>,
        wire: Arc<WireClient>,
        segment_size: u64,
    ) -> Self {
        Self {
            store,
            kernel,
            wire,
            segment_size,
        }
    }

    /// Mint a share identifier: uniform randomness, nothing derivable.
    pub fn mint_share_id() -> Result<String> {
        let mut raw = [0u8; SHARE_ID_RAW_LEN];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|e| Error::crypto(format!("rng failure: {}", e)))?;
        let encoded = data_encoding::BASE32_NOPAD.encode(&raw);
        debug_assert_eq!(encoded.len(), SHARE_ID_LEN);
        Ok(encoded)
    }

    /// PUBLIC access string: version byte, share id, tier tag, content key,
    /// URL-safe base64. Self-delimiting; the version byte drives parsing.
    pub fn encode_access_string(share_id: &str, content_key: &[u8; 32]) -> String {
        let mut envelope = Vec::with_capacity(1 + SHARE_ID_LEN + 1 + 32);
        envelope.push(ACCESS_VERSION);
        envelope.extend_from_slice(share_id.as_bytes());
        envelope.push(TIER_TAG_PUBLIC);
        envelope.extend_from_slice(content_key);
        data_encoding::BASE64URL_NOPAD.encode(&envelope)
    }

    pub fn decode_access_string(access_string: &str) -> Result<(String, [u8; 32])> {
        let envelope = data_encoding::BASE64URL_NOPAD
            .decode(access_string.as_bytes())
            .map_err(|_| Error::crypto("malformed access string"))?;
        if envelope.len() != 1 + SHARE_ID_LEN + 1 + 32 {
            return Err(Error::crypto("malformed access string"));
        }
        if envelope[0] != ACCESS_VERSION {
            return Err(Error::crypto("unsupported access string version"));
        }
        let share_id = std::str::from_utf8(&envelope[1..1 + SHARE_ID_LEN])
            .map_err(|_| Error::crypto("malformed access string"))?
            .to_string();
        if envelope[1 + SHARE_ID_LEN] != TIER_TAG_PUBLIC {
            return Err(Error::crypto("unsupported access tier tag"));
        }
        let key: [u8; 32] = envelope[1 + SHARE_ID_LEN + 1..]
            .try_into()
            .map_err(|_| Error::crypto("malformed access string"))?;
        Ok((share_id, key))
    }

    /// Assemble the core index for one uploaded folder version from the
    /// store's segment map.
    pub async fn build_index(&self, folder_id: &str, version: u64) -> Result<CoreIndex> {
        let mut tx = self.store.begin().await?;
        let folder = tx.require_folder(folder_id).await?;
        let files = tx.files_at_version(folder_id, version).await?;
        let segments = tx.segments_for_folder_version(folder_id, version).await?;

        // Group redundancy copies under their logical segment.
        let mut logical: Vec<IndexSegment> = Vec::new();
        let mut grouped: std::collections::BTreeMap<(String, u32), Vec<&Segment>> =
            Default::default();
        for segment in &segments {
            let owner_id = match &segment.owner {
                SegmentOwner::File(id) | SegmentOwner::Pack(id) => id.clone(),
            };
            grouped
                .entry((owner_id, segment.segment_index))
                .or_default()
                .push(segment);
        }

        let file_by_id: std::collections::HashMap<&str, _> = files
            .iter()
            .map(|file| (file.file_id.as_str(), file))
            .collect();

        for ((owner_id, segment_index), mut copies) in grouped {
            copies.sort_by_key(|segment| segment.redundancy_index);
            let posted: Vec<&&Segment> = copies
                .iter()
                .filter(|segment| segment.state == SegmentState::Posted)
                .collect();
            if posted.is_empty() {
                return Err(Error::policy(format!(
                    "segment {}:{} has no posted copy; upload incomplete",
                    owner_id, segment_index
                )));
            }

            let mut refs = Vec::with_capacity(posted.len());
            for segment in &posted {
                let sealed = segment
                    .article_ref_enc
                    .as_deref()
                    .ok_or_else(|| Error::storage("posted segment without article ref"))?;
                let raw = self.kernel.open_at_rest(sealed)?;
                let article_ref: ArticleRef = rmp_serde::from_slice(&raw)
                    .map_err(|e| Error::storage(format!("article ref decode: {}", e)))?;
                refs.push(article_ref);
            }

            let head = posted[0];
            let target = match &head.owner {
                SegmentOwner::File(file_id) => {
                    let file = file_by_id.get(file_id.as_str()).ok_or_else(|| {
                        Error::storage(format!("segment references unknown file {}", file_id))
                    })?;
                    SegmentTarget::Stream {
                        relative_path: file.relative_path.clone(),
                        offset: head.offset,
                    }
                }
                SegmentOwner::Pack(pack_id) => {
                    let pack = tx
                        .get_pack(pack_id)
                        .await?
                        .ok_or_else(|| Error::storage(format!("unknown pack {}", pack_id)))?;
                    let mut members = Vec::with_capacity(pack.members.len());
                    for member in &pack.members {
                        let file = file_by_id.get(member.file_id.as_str()).ok_or_else(|| {
                            Error::storage(format!(
                                "pack references unknown file {}",
                                member.file_id
                            ))
                        })?;
                        members.push(IndexPackMember {
                            relative_path: file.relative_path.clone(),
                            offset_in_pack: member.offset_in_pack,
                            length: member.length,
                        });
                    }
                    SegmentTarget::Pack { members }
                }
            };

            logical.push(IndexSegment {
                key: format!("{}:{}", owner_id, segment_index),
                internal_subject: head.internal_subject.clone(),
                content_hash: head.content_hash.clone(),
                length: head.length,
                target,
                copies: refs,
            });
        }
        tx.rollback().await?;

        let live_files: Vec<IndexFile> = files
            .iter()
            .filter(|file| file.error.is_none())
            .map(|file| IndexFile {
                relative_path: file.relative_path.clone(),
                kind: file.kind,
                size: file.size,
                content_hash: file.content_hash.clone(),
            })
            .collect();

        Ok(CoreIndex {
            folder_id: folder.folder_id.clone(),
            version,
            public_key: folder.public_key.clone(),
            created_at: chrono::Utc::now(),
            file_count: live_files
                .iter()
                .filter(|file| file.kind == FileKind::File)
                .count() as u64,
            total_bytes: live_files.iter().map(|file| file.size).sum(),
            files: live_files,
            segments: logical,
        })
    }

    /// Post the sealed index, mint the share, persist tier material.
    pub async fn publish(
        &self,
        folder_id: &str,
        version: u64,
        owner_id: &str,
        params: TierParams,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Published> {
        // Content key per tier.
        let (tier, content_key, auth_seed) = match &params {
            TierParams::Public => {
                let key = self.kernel.mint_content_key()?;
                (ShareTier::Public, key, None)
            }
            TierParams::Private { .. } => {
                let key = self.kernel.mint_content_key()?;
                (ShareTier::Private, key, None)
            }
            TierParams::Protected { password } => {
                let salt = kdf::generate_salt()?;
                let kdf_params = *self.kernel.kdf_params();
                let key = kdf::derive_key(password.as_bytes(), &salt, &kdf_params)?;
                (ShareTier::Protected, key, Some((salt, kdf_params)))
            }
        };

        let core_index = self.build_index(folder_id, version).await?;
        let folder = {
            let mut tx = self.store.begin().await?;
            let folder = tx.require_folder(folder_id).await?;
            tx.rollback().await?;
            folder
        };
        let keys = FolderKeys::unseal(&self.kernel, &folder.private_key_enc)?;
        let sealed = core_index.seal(&keys, &content_key)?;

        // Post, splitting oversized payloads with an outer reference table
        // as the final article.
        let sealed_bytes = rmp_serde::to_vec(&sealed)
            .map_err(|e| Error::storage(format!("sealed index encode: {}", e)))?;
        let envelope = if sealed_bytes.len() as u64 <= self.segment_size {
            IndexEnvelope::Inline { sealed }
        } else {
            let mut refs = Vec::new();
            for chunk in sealed_bytes.chunks(self.segment_size as usize) {
                let subject = obfuscate::posted_subject()?;
                refs.push(self.wire.post_segment(&subject, chunk).await?);
            }
            IndexEnvelope::Chunked { refs }
        };
        let envelope_bytes = rmp_serde::to_vec(&envelope)
            .map_err(|e| Error::storage(format!("envelope encode: {}", e)))?;
        let top_subject = obfuscate::posted_subject()?;
        let top_ref = self.wire.post_segment(&top_subject, &envelope_bytes).await?;

        let share_id = Self::mint_share_id()?;
        let index_ref_enc = self.kernel.seal_at_rest(
            &rmp_serde::to_vec(&top_ref)
                .map_err(|e| Error::storage(format!("index ref encode: {}", e)))?,
        )?;

        let (auth, commitments, access_string) = match &params {
            TierParams::Public => {
                let access = Self::encode_access_string(&share_id, &content_key);
                (
                    ShareAuth::Public {
                        content_key_enc: self.kernel.seal_at_rest(&content_key)?,
                    },
                    Vec::new(),
                    Some(access),
                )
            }
            TierParams::Private { authorized_users } => {
                let wrapper = commit::KeyWrapper::new();
                let mut rows = Vec::with_capacity(authorized_users.len());
                for user_id in authorized_users {
                    let commitment = commit::commitment(user_id);
                    rows.push(Commitment {
                        share_id: share_id.clone(),
                        commitment: commitment.to_vec(),
                        wrapped_key: wrapper.wrap(&commitment, &content_key)?,
                    });
                }
                (
                    ShareAuth::Private {
                        ephemeral: wrapper.public_bytes().to_vec(),
                    },
                    rows,
                    None,
                )
            }
            TierParams::Protected { .. } => {
                let (salt, kdf_params) = auth_seed.expect("protected tier sets the seed");
                (
                    ShareAuth::Protected {
                        salt: salt.to_vec(),
                        m_cost_kib: kdf_params.m_cost_kib,
                        t_cost: kdf_params.t_cost,
                        p_cost: kdf_params.p_cost,
                    },
                    Vec::new(),
                    None,
                )
            }
        };

        let share = Share {
            share_id: share_id.clone(),
            folder_id: folder_id.to_string(),
            folder_version: version,
            tier,
            index_ref_enc,
            owner_id: owner_id.to_string(),
            auth,
            created_at: chrono::Utc::now(),
            expires_at,
            revoked: false,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_share(&share).await?;
        tx.insert_commitments(&commitments).await?;
        tx.commit().await?;

        tracing::info!(share_id = %share_id, tier = tier.as_str(), "published share");
        Ok(Published {
            share_id,
            access_string,
        })
    }

    /// Resolve a share into its decrypted core index and content key.
    ///
    /// Every refusal on this path is the same crypto error with the same
    /// message: an unknown share id, a mismatched tier, and wrong
    /// credentials on a real share are indistinguishable to the caller, so
    /// probing ids learns nothing.
    pub async fn resolve(
        &self,
        share_id: &str,
        params: &AccessParams,
    ) -> Result<(CoreIndex, [u8; 32])> {
        let share = {
            let mut tx = self.store.begin().await?;
            let share = tx
                .get_share(share_id)
                .await?
                .ok_or_else(|| Error::crypto(ACCESS_DENIED))?;
            tx.rollback().await?;
            share
        };
        let expired = share
            .expires_at
            .map(|expiry| expiry < chrono::Utc::now())
            .unwrap_or(false);
        if share.revoked || expired {
            return Err(Error::crypto(ACCESS_DENIED));
        }

        let content_key: [u8; 32] = match (&share.auth, params) {
            (ShareAuth::Public { .. }, AccessParams::Public { access_string }) => {
                let (embedded_id, key) = Self::decode_access_string(access_string)
                    .map_err(|_| Error::crypto(ACCESS_DENIED))?;
                if embedded_id != share.share_id {
                    return Err(Error::crypto(ACCESS_DENIED));
                }
                key
            }
            (ShareAuth::Private { ephemeral }, AccessParams::Private { user_id }) => {
                let commitment = commit::commitment(user_id);
                // Prove knowledge of the identifier against the stored
                // commitment before any key material moves.
                let proof = commit::prove(user_id, share.share_id.as_bytes());
                commit::verify(&commitment, &proof, share.share_id.as_bytes())
                    .map_err(|_| Error::crypto(ACCESS_DENIED))?;

                let row = {
                    let mut tx = self.store.begin().await?;
                    let row = tx.get_commitment(&share.share_id, &commitment).await?;
                    tx.rollback().await?;
                    row
                };
                let row = row.ok_or_else(|| Error::crypto(ACCESS_DENIED))?;
                commit::unwrap_key(user_id, ephemeral, &row.wrapped_key)
                    .map_err(|_| Error::crypto(ACCESS_DENIED))?
            }
            (
                ShareAuth::Protected {
                    salt,
                    m_cost_kib,
                    t_cost,
                    p_cost,
                },
                AccessParams::Protected { password },
            ) => {
                // Exactly one KDF attempt.
                let kdf_params = KdfParams {
                    m_cost_kib: *m_cost_kib,
                    t_cost: *t_cost,
                    p_cost: *p_cost,
                };
                kdf::derive_key(password.as_bytes(), salt, &kdf_params)?
            }
            _ => return Err(Error::crypto(ACCESS_DENIED)),
        };

        // Locate and retrieve the sealed index.
        let top_ref: ArticleRef = {
            let raw = self.kernel.open_at_rest(&share.index_ref_enc)?;
            rmp_serde::from_slice(&raw)
                .map_err(|e| Error::storage(format!("index ref decode: {}", e)))?
        };
        let envelope_bytes = self.wire.fetch_segment(&top_ref).await?;
        let envelope: IndexEnvelope = rmp_serde::from_slice(&envelope_bytes)
            .map_err(|e| Error::integrity(format!("index envelope decode: {}", e)))?;

        let sealed = match envelope {
            IndexEnvelope::Inline { sealed } => sealed,
            IndexEnvelope::Chunked { refs } => {
                let mut bytes = Vec::new();
                for article_ref in &refs {
                    bytes.extend_from_slice(&self.wire.fetch_segment(article_ref).await?);
                }
                rmp_serde::from_slice(&bytes)
                    .map_err(|e| Error::integrity(format!("sealed index decode: {}", e)))?
            }
        };

        // A wrong key fails AEAD; report it as the same uniform denial,
        // not corruption.
        let core_index = CoreIndex::open(&sealed, &content_key).map_err(|e| match e {
            Error::Integrity(_) => Error::crypto(ACCESS_DENIED),
            other => other,
        })?;
        Ok((core_index, content_key))
    }

    /// Revoke one user's access to a PRIVATE share, or the whole share for
    /// other tiers. The substrate articles are untouchable by design;
    /// revocation only invalidates key material.
    pub async fn revoke(&self, share_id: &str, user_id: Option<&str>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let share = tx
            .get_share(share_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown share {}", share_id)))?;

        match (&share.tier, user_id) {
            (ShareTier::Private, Some(user_id)) => {
                let commitment = commit::commitment(user_id);
                if !tx.delete_commitment(share_id, &commitment).await? {
                    return Err(Error::NotFound(
                        "no commitment for that user on this share".to_string(),
                    ));
                }
            }
            (ShareTier::Private, None) => {
                tx.revoke_share(share_id).await?;
            }
            (_, _) => {
                tx.revoke_share(share_id).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_id_shape_and_uniqueness() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = Publisher::mint_share_id().unwrap();
            assert_eq!(id.len(), SHARE_ID_LEN);
            // RFC 4648 base32 alphabet only.
            assert!(id
                .chars()
                .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
            assert!(seen.insert(id));
        }
    }

    /// Share ids must look uniform: over many samples, every alphabet
    /// character appears with roughly equal frequency at every position
    /// mix, and nothing about tier or folder is observable.
    #[test]
    fn test_share_id_distribution_is_flat() {
        const SAMPLES: usize = 10_000;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..SAMPLES {
            for c in Publisher::mint_share_id().unwrap().chars() {
                *counts.entry(c).or_insert(0u64) += 1;
            }
        }
        assert_eq!(counts.len(), 32);
        let total: u64 = counts.values().sum();
        let mean = total as f64 / 32.0;
        for (c, count) in counts {
            let deviation = (count as f64 - mean).abs() / mean;
            assert!(
                deviation < 0.1,
                "character {} deviates {:.1}% from uniform",
                c,
                deviation * 100.0
            );
        }
    }

    #[test]
    fn test_access_string_round_trip() {
        let share_id = Publisher::mint_share_id().unwrap();
        let key = [0xABu8; 32];
        let access = Publisher::encode_access_string(&share_id, &key);
        // URL-safe, no padding.
        assert!(!access.contains('=') && !access.contains('+') && !access.contains('/'));
        let (decoded_id, decoded_key) = Publisher::decode_access_string(&access).unwrap();
        assert_eq!(decoded_id, share_id);
        assert_eq!(decoded_key, key);
    }

    #[test]
    fn test_access_string_rejects_garbage() {
        assert!(Publisher::decode_access_string("not-base64!!").is_err());
        let share_id = Publisher::mint_share_id().unwrap();
        let access = Publisher::encode_access_string(&share_id, &[1u8; 32]);
        // Truncation breaks the fixed-length envelope.
        assert!(Publisher::decode_access_string(&access[..access.len() - 4]).is_err());
    }
}
