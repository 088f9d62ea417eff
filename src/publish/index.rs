//! Core index
//!
//! The only artifact needed to reconstruct a folder version. Binary
//! (MessagePack), gzip-compressed, encrypted under the share content key,
//! and signed by the folder key. Article references travel in the clear
//! *inside* the encrypted payload; nothing outside it can read them.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::crypto::{keys, stream, FolderKeys};
use crate::types::{ArticleRef, FileKind};
use crate::{Error, Result};

/// Manifest of one folder version as posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreIndex {
    pub folder_id: String,
    pub version: u64,
    /// Folder verifying key; fetchers check the signature against it.
    pub public_key: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub file_count: u64,
    pub total_bytes: u64,
    pub files: Vec<IndexFile>,
    pub segments: Vec<IndexSegment>,
}

/// One manifest entry; directories reconstruct empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub relative_path: String,
    pub kind: FileKind,
    pub size: u64,
    pub content_hash: String,
}

/// One logical segment with every redundancy copy's article reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSegment {
    /// Stable key for resume bookkeeping; unique within the index.
    pub key: String,
    /// Deterministic verification tag; also the AEAD context for the
    /// segment payload.
    pub internal_subject: String,
    pub content_hash: String,
    pub length: u64,
    pub target: SegmentTarget,
    /// Redundancy copies in fallback order (primary first).
    pub copies: Vec<ArticleRef>,
}

/// Where a decrypted segment's plaintext lands on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SegmentTarget {
    /// A range of one file.
    Stream { relative_path: String, offset: u64 },
    /// A pack: each member is one whole small file.
    Pack { members: Vec<IndexPackMember> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPackMember {
    pub relative_path: String,
    pub offset_in_pack: u64,
    pub length: u64,
}

/// Envelope that actually crosses the wire: compressed-and-encrypted index
/// chunks plus the signature over the plaintext index bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedIndex {
    /// Streaming-AEAD chunks of the gzipped index.
    pub chunks: Vec<Vec<u8>>,
    /// Closing tag over the chunk transcript.
    pub stream_tag: Vec<u8>,
    /// Ed25519 signature by the folder key over the index bytes.
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl CoreIndex {
    /// Serialize, compress, encrypt, and sign.
    pub fn seal(&self, keys: &FolderKeys, content_key: &[u8; 32]) -> Result<SealedIndex> {
        let encoded = rmp_serde::to_vec(self)
            .map_err(|e| Error::storage(format!("core index encode: {}", e)))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encoded)?;
        let compressed = encoder.finish()?;

        let (chunks, stream_tag) = stream::seal_all(*content_key, &compressed)?;
        let signature = keys.sign(&encoded).to_vec();

        Ok(SealedIndex {
            chunks,
            stream_tag,
            signature,
            public_key: keys.public_bytes().to_vec(),
        })
    }

    /// Decrypt, decompress, verify signature, deserialize.
    pub fn open(sealed: &SealedIndex, content_key: &[u8; 32]) -> Result<CoreIndex> {
        let compressed = stream::open_all(*content_key, &sealed.chunks, &sealed.stream_tag)?;

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut encoded = Vec::new();
        decoder.read_to_end(&mut encoded)?;

        keys::verify_signature(&sealed.public_key, &encoded, &sealed.signature)?;

        let index: CoreIndex = rmp_serde::from_slice(&encoded)
            .map_err(|e| Error::integrity(format!("core index decode: {}", e)))?;
        if index.public_key != sealed.public_key {
            return Err(Error::integrity("index signer does not match embedded key"));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(keys: &FolderKeys) -> CoreIndex {
        CoreIndex {
            folder_id: "f1".to_string(),
            version: 3,
            public_key: keys.public_bytes().to_vec(),
            created_at: chrono::Utc::now(),
            file_count: 1,
            total_bytes: 5,
            files: vec![IndexFile {
                relative_path: "a.txt".to_string(),
                kind: FileKind::File,
                size: 5,
                content_hash: "ab".repeat(32),
            }],
            segments: vec![IndexSegment {
                key: "seg-0".to_string(),
                internal_subject: "cd".repeat(32),
                content_hash: "ab".repeat(32),
                length: 5,
                target: SegmentTarget::Stream {
                    relative_path: "a.txt".to_string(),
                    offset: 0,
                },
                copies: vec![ArticleRef {
                    group: "alt.binaries.misc".to_string(),
                    parts: vec!["<x@y.invalid>".to_string()],
                }],
            }],
        }
    }

    #[test]
    fn test_seal_open_round_trip() {
        let keys = FolderKeys::generate();
        let content_key = [9u8; 32];
        let index = sample_index(&keys);

        let sealed = index.seal(&keys, &content_key).unwrap();
        let opened = CoreIndex::open(&sealed, &content_key).unwrap();
        assert_eq!(opened.folder_id, "f1");
        assert_eq!(opened.version, 3);
        assert_eq!(opened.segments.len(), 1);
        assert_eq!(opened.files[0].relative_path, "a.txt");
    }

    #[test]
    fn test_wrong_key_fails() {
        let keys = FolderKeys::generate();
        let index = sample_index(&keys);
        let sealed = index.seal(&keys, &[9u8; 32]).unwrap();
        assert!(CoreIndex::open(&sealed, &[10u8; 32]).is_err());
    }

    #[test]
    fn test_forged_signature_rejected() {
        let keys = FolderKeys::generate();
        let content_key = [9u8; 32];
        let index = sample_index(&keys);
        let mut sealed = index.seal(&keys, &content_key).unwrap();

        // Re-sign with a different key but keep the original public key.
        let other = FolderKeys::generate();
        let encoded = rmp_serde::to_vec(&index).unwrap();
        sealed.signature = other.sign(&encoded).to_vec();
        assert!(CoreIndex::open(&sealed, &content_key).is_err());
    }
}
