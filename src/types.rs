//! Core entity types for usenetsync
//!
//! Every entity lives in the metadata store. Identifiers crossing the
//! substrate are opaque; nothing in them encodes folder, version, tier, or
//! segment position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Opaque entity identifiers (uuid-v4 simple form, or purpose-specific
/// encodings documented per entity).
pub type FolderId = String;
pub type FileId = String;
pub type SegmentId = String;
pub type PackId = String;
pub type ShareId = String;
pub type SessionId = String;
/// 256-bit hex, minted once per store, never regenerated.
pub type UserId = String;

/// Mint a fresh opaque id for internal entities.
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The local operator. Exactly one row exists per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    /// Ed25519 verifying key bytes.
    pub public_key: Vec<u8>,
    /// Signing key, encrypted under the store master key.
    pub private_key_enc: Vec<u8>,
}

/// Folder lifecycle status.
///
/// Transitions follow a fixed DAG; `syncing` loops a published folder back
/// into indexing, `error` is reachable from any transient state and admits
/// a retry edge back to the state that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStatus {
    Added,
    Indexing,
    Indexed,
    Segmenting,
    Segmented,
    Uploading,
    Uploaded,
    Publishing,
    Published,
    Syncing,
    Error,
}

impl FolderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderStatus::Added => "added",
            FolderStatus::Indexing => "indexing",
            FolderStatus::Indexed => "indexed",
            FolderStatus::Segmenting => "segmenting",
            FolderStatus::Segmented => "segmented",
            FolderStatus::Uploading => "uploading",
            FolderStatus::Uploaded => "uploaded",
            FolderStatus::Publishing => "publishing",
            FolderStatus::Published => "published",
            FolderStatus::Syncing => "syncing",
            FolderStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "added" => FolderStatus::Added,
            "indexing" => FolderStatus::Indexing,
            "indexed" => FolderStatus::Indexed,
            "segmenting" => FolderStatus::Segmenting,
            "segmented" => FolderStatus::Segmented,
            "uploading" => FolderStatus::Uploading,
            "uploaded" => FolderStatus::Uploaded,
            "publishing" => FolderStatus::Publishing,
            "published" => FolderStatus::Published,
            "syncing" => FolderStatus::Syncing,
            "error" => FolderStatus::Error,
            other => return Err(Error::storage(format!("unknown folder status: {}", other))),
        })
    }

    /// States a folder may legally move to from `self`.
    pub fn successors(&self) -> &'static [FolderStatus] {
        use FolderStatus::*;
        match self {
            Added => &[Indexing],
            Indexing => &[Indexed, Error],
            Indexed => &[Segmenting, Indexing],
            // Re-entering the same stage is how idempotent reruns start.
            Segmenting => &[Segmented, Error],
            Segmented => &[Uploading, Segmenting, Indexing],
            Uploading => &[Uploaded, Error],
            Uploaded => &[Publishing, Uploading, Indexing],
            Publishing => &[Published, Error],
            Published => &[Syncing, Publishing, Indexing],
            Syncing => &[Indexing, Error],
            // Retry re-enters the transient state that failed; the engine
            // records that state alongside the error.
            Error => &[Indexing, Segmenting, Uploading, Publishing, Syncing],
        }
    }

    pub fn can_transition_to(&self, next: FolderStatus) -> bool {
        *self == next || self.successors().contains(&next)
    }
}

/// Aggregate statistics carried on the folder row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FolderStats {
    pub file_count: u64,
    pub total_bytes: u64,
    pub segment_count: u64,
}

/// A managed directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: FolderId,
    /// Absolute local path of the tree root.
    pub path: String,
    /// Current version; starts at 1, increments on each successful index run.
    pub version: u64,
    pub status: FolderStatus,
    /// Ed25519 verifying key bytes; the keypair is generated at creation and
    /// never rotated.
    pub public_key: Vec<u8>,
    /// Signing key, encrypted under the store master key.
    pub private_key_enc: Vec<u8>,
    pub stats: FolderStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a manifest entry is a regular file or a (possibly empty)
/// directory that must be recreated on reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

/// A file observed during indexing at a specific folder version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: FileId,
    pub folder_id: FolderId,
    /// Forward-slash normalized, no leading slash.
    pub relative_path: String,
    pub kind: FileKind,
    pub size: u64,
    /// SHA-256 over the file bytes, hex encoded.
    pub content_hash: String,
    pub version_first_seen: u64,
    /// Null while the path is current; set to the last version at which the
    /// path existed once it disappears.
    pub version_last_seen: Option<u64>,
    pub modified_at: DateTime<Utc>,
    /// Set when per-file IO failed during indexing; the run continues.
    pub error: Option<String>,
}

/// Indexing delta classification against the prior version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Unchanged,
    Added,
    Modified,
    Removed,
}

/// Upload state of one posted copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Inflight,
    Posted,
    Failed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::Inflight => "inflight",
            SegmentState::Posted => "posted",
            SegmentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => SegmentState::Pending,
            "inflight" => SegmentState::Inflight,
            "posted" => SegmentState::Posted,
            "failed" => SegmentState::Failed,
            other => return Err(Error::storage(format!("unknown segment state: {}", other))),
        })
    }
}

/// Logical source of a segment's plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum SegmentOwner {
    File(FileId),
    Pack(PackId),
}

/// One fixed-size unit of encrypted payload, posted as one logical article.
///
/// Redundancy copies are full rows of their own: they share the plaintext
/// range and content hash of the primary but every posted/obfuscated field
/// is freshly generated, so each copy is a unique article on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: SegmentId,
    pub folder_id: FolderId,
    pub version: u64,
    pub owner: SegmentOwner,
    /// Index within the owning file (or pack sequence). Re-segmenting a
    /// modified file restarts this sequence at zero.
    pub segment_index: u32,
    /// 0 = primary; >= 1 are additional unique copies.
    pub redundancy_index: u32,
    /// Plaintext range within the logical source.
    pub offset: u64,
    pub length: u64,
    /// SHA-256 of the plaintext range, hex encoded.
    pub content_hash: String,
    /// SHA-256 of the encrypted payload as posted, hex encoded.
    pub payload_hash: String,
    /// Serialized article reference, encrypted at rest. Null until posted.
    pub article_ref_enc: Option<Vec<u8>>,
    /// 20 random characters; the only subject that crosses the wire.
    pub posted_subject: String,
    /// Deterministic 64-hex verification tag. Never posted.
    pub internal_subject: String,
    pub state: SegmentState,
    pub retry_count: u32,
}

/// Member of a pack: a small file folded into one segment-sized plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackMember {
    pub file_id: FileId,
    pub offset_in_pack: u64,
    pub length: u64,
}

/// A grouping of small files packed into one segment-sized plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub pack_id: PackId,
    pub folder_id: FolderId,
    pub version: u64,
    pub members: Vec<PackMember>,
}

/// Access tier of a share. Stored only in the local share record; the share
/// identifier itself carries no tier information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareTier {
    Public,
    Private,
    Protected,
}

impl ShareTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareTier::Public => "public",
            ShareTier::Private => "private",
            ShareTier::Protected => "protected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "public" => ShareTier::Public,
            "private" => ShareTier::Private,
            "protected" => ShareTier::Protected,
            other => return Err(Error::storage(format!("unknown share tier: {}", other))),
        })
    }
}

/// Tier-specific authorization material stored on the share row.
///
/// PRIVATE wrapped keys live in the commitments table, one row per
/// authorized user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "tier")]
pub enum ShareAuth {
    Public {
        /// Content key, encrypted under the store master key. The same key
        /// travels in the access string; this copy lets the owner re-emit
        /// the access string.
        content_key_enc: Vec<u8>,
    },
    Private {
        /// Ephemeral public point for the key-wrap DH, 32 bytes.
        ephemeral: Vec<u8>,
    },
    Protected {
        /// KDF salt; the password and derived key are never stored.
        salt: Vec<u8>,
        m_cost_kib: u32,
        t_cost: u32,
        p_cost: u32,
    },
}

/// A publishable handle to one folder version's core index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    /// 24-char base32 over 15 random bytes. No prefix, no embedded data.
    pub share_id: ShareId,
    pub folder_id: FolderId,
    pub folder_version: u64,
    pub tier: ShareTier,
    /// Article reference of the core index top article, encrypted at rest.
    pub index_ref_enc: Vec<u8>,
    pub owner_id: UserId,
    pub auth: ShareAuth,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// Per-authorized-user record for a PRIVATE share. Carries no plaintext
/// user identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub share_id: ShareId,
    /// Ristretto commitment point over the user identifier, 32 bytes.
    pub commitment: Vec<u8>,
    /// Content key wrapped so only the committed user can unwrap it.
    pub wrapped_key: Vec<u8>,
}

/// Terminal or in-flight status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "running" => SessionStatus::Running,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "cancelled" => SessionStatus::Cancelled,
            other => return Err(Error::storage(format!("unknown session status: {}", other))),
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Which pipeline a session row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Upload,
    Download,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Upload => "upload",
            SessionKind::Download => "download",
        }
    }
}

/// Durable bookkeeping for one orchestrated upload or download run.
///
/// The session row is the single progress channel; callers poll it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub kind: SessionKind,
    /// Folder id for uploads, share id for downloads.
    pub subject_id: String,
    /// Destination directory (downloads only).
    pub destination: Option<String>,
    pub total_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub status: SessionStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Progress snapshot returned from `poll_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub total_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl From<Session> for Progress {
    fn from(s: Session) -> Self {
        Progress {
            session_id: s.session_id,
            kind: s.kind,
            status: s.status,
            total_count: s.total_count,
            completed_count: s.completed_count,
            failed_count: s.failed_count,
            total_bytes: s.total_bytes,
            transferred_bytes: s.transferred_bytes,
            error_kind: s.error_kind,
            error_message: s.error_message,
        }
    }
}

/// Upload queue priority bands, lowest number drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            4 => Priority::Background,
            other => return Err(Error::storage(format!("unknown priority band: {}", other))),
        })
    }
}

/// State of a queue row (upload and download queues share the vocabulary;
/// `verified` and `failed` are download outcomes that survive for resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Inflight,
    Verified,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Inflight => "inflight",
            QueueState::Verified => "verified",
            QueueState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => QueueState::Pending,
            "inflight" => QueueState::Inflight,
            "verified" => QueueState::Verified,
            "failed" => QueueState::Failed,
            other => return Err(Error::storage(format!("unknown queue state: {}", other))),
        })
    }
}

/// A claimable unit of upload work: one segment row (one posted copy).
#[derive(Debug, Clone)]
pub struct UploadQueueRow {
    pub queue_id: i64,
    pub session_id: SessionId,
    pub segment_id: SegmentId,
    pub priority: Priority,
    pub state: QueueState,
    pub retry_count: u32,
    pub not_before: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

/// A claimable unit of download work: one logical segment of the plan,
/// with all redundancy copies available for fallback.
#[derive(Debug, Clone)]
pub struct DownloadQueueRow {
    pub queue_id: i64,
    pub session_id: SessionId,
    /// rmp-encoded `publish::PlanSegment`.
    pub plan_blob: Vec<u8>,
    pub state: QueueState,
    pub retry_count: u32,
    pub not_before: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

/// One posted (possibly multi-part) article, addressable on the substrate.
///
/// Serialized with rmp and encrypted before it touches the store; nothing
/// here is ever persisted or posted in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRef {
    pub group: String,
    /// Message ids of all parts, in order. Single-part articles have one.
    pub parts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_status_dag() {
        use FolderStatus::*;
        assert!(Added.can_transition_to(Indexing));
        assert!(Indexing.can_transition_to(Indexed));
        assert!(Indexing.can_transition_to(Error));
        assert!(Published.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Indexing));
        assert!(Error.can_transition_to(Uploading));
        assert!(!Added.can_transition_to(Published));
        assert!(!Indexed.can_transition_to(Uploaded));
        // Idempotent self-transition is always legal.
        assert!(Uploading.can_transition_to(Uploading));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            FolderStatus::Added,
            FolderStatus::Indexing,
            FolderStatus::Published,
            FolderStatus::Error,
        ] {
            assert_eq!(FolderStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(FolderStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_priority_bands() {
        assert_eq!(Priority::Critical.as_i64(), 0);
        assert_eq!(Priority::from_i64(4).unwrap(), Priority::Background);
        assert!(Priority::from_i64(9).is_err());
        assert!(Priority::Critical < Priority::Background);
    }

    #[test]
    fn test_article_ref_round_trip() {
        let r = ArticleRef {
            group: "alt.binaries.misc".to_string(),
            parts: vec!["<abc@example.invalid>".to_string()],
        };
        let blob = rmp_serde::to_vec(&r).unwrap();
        let back: ArticleRef = rmp_serde::from_slice(&blob).unwrap();
        assert_eq!(back, r);
    }
}
