//! Subject and message-id obfuscation
//!
//! Two subjects exist per segment. The internal subject is deterministic
//! over folder-private material and is only ever compared locally to check
//! that a retrieved article matches its expected logical position. The
//! posted subject and message-id are pure randomness; nothing observable on
//! the wire correlates with sender, folder, version, or position.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::keys::FolderKeys;
use crate::{Error, Result};

/// Posted-subject alphabet: visually ambiguous glyphs (0, O, I, l, 1, o)
/// are excluded.
const SUBJECT_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";

pub const POSTED_SUBJECT_LEN: usize = 20;

const MESSAGE_ID_LOCAL_LEN: usize = 22;
const MESSAGE_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Innocuous host parts rotated across message-ids.
const MESSAGE_ID_DOMAINS: &[&str] = &[
    "reader.example.net",
    "post.gateway.org",
    "news.relay.net",
    "mail.hub.org",
    "client.access.net",
];

/// Deterministic 64-hex internal subject over folder-private material.
///
/// Doubles as the segment's verification tag; it never crosses the wire.
pub fn internal_subject(
    keys: &FolderKeys,
    folder_id: &str,
    version: u64,
    segment_index: u32,
    salt: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(*keys.secret_bytes());
    hasher.update(folder_id.as_bytes());
    hasher.update(version.to_le_bytes());
    hasher.update(segment_index.to_le_bytes());
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

/// 20 uniform random characters. Carries zero information.
pub fn posted_subject() -> Result<String> {
    random_string(SUBJECT_ALPHABET, POSTED_SUBJECT_LEN)
}

/// Randomized message id with a host part drawn from the rotation pool.
/// No timestamps, no content hashes, nothing recoverable by observation.
pub fn message_id() -> Result<String> {
    let local = random_string(MESSAGE_ID_ALPHABET, MESSAGE_ID_LOCAL_LEN)?;
    let domain = MESSAGE_ID_DOMAINS[OsRng.gen_range(0..MESSAGE_ID_DOMAINS.len())];
    Ok(format!("<{}@{}>", local, domain))
}

fn random_string(alphabet: &[u8], len: usize) -> Result<String> {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let idx = OsRng.gen_range(0..alphabet.len());
        out.push(alphabet[idx] as char);
    }
    if out.len() != len {
        return Err(Error::crypto("rng failure"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_subject_deterministic() {
        let keys = FolderKeys::generate();
        let a = internal_subject(&keys, "folder-1", 3, 7, b"salt");
        let b = internal_subject(&keys, "folder-1", 3, 7, b"salt");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_internal_subject_position_bound() {
        let keys = FolderKeys::generate();
        let base = internal_subject(&keys, "folder-1", 3, 7, b"salt");
        assert_ne!(base, internal_subject(&keys, "folder-1", 3, 8, b"salt"));
        assert_ne!(base, internal_subject(&keys, "folder-1", 4, 7, b"salt"));
        assert_ne!(base, internal_subject(&keys, "folder-2", 3, 7, b"salt"));
        assert_ne!(base, internal_subject(&keys, "folder-1", 3, 7, b"pepper"));
    }

    #[test]
    fn test_posted_subject_shape() {
        let subject = posted_subject().unwrap();
        assert_eq!(subject.len(), POSTED_SUBJECT_LEN);
        for c in subject.bytes() {
            assert!(SUBJECT_ALPHABET.contains(&c));
        }
        // Ambiguous glyphs never appear.
        for forbidden in [b'0', b'O', b'I', b'l', b'1', b'o'] {
            assert!(!SUBJECT_ALPHABET.contains(&forbidden));
        }
    }

    #[test]
    fn test_posted_subject_unique() {
        let a = posted_subject().unwrap();
        let b = posted_subject().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_id_shape() {
        let id = message_id().unwrap();
        assert!(id.starts_with('<') && id.ends_with('>'));
        let inner = &id[1..id.len() - 1];
        let (local, domain) = inner.split_once('@').unwrap();
        assert_eq!(local.len(), MESSAGE_ID_LOCAL_LEN);
        assert!(MESSAGE_ID_DOMAINS.contains(&domain));
    }

    #[test]
    fn test_posted_never_matches_internal() {
        // Internal subjects are 64 hex chars; posted subjects are 20 chars
        // from a non-hex alphabet. Length alone keeps the sets disjoint.
        assert_ne!(POSTED_SUBJECT_LEN, 64);
    }
}
