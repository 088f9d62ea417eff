//! Zero-knowledge commitments for private shares
//!
//! A user's secret scalar is derived from their permanent identifier; the
//! commitment published on the share is the corresponding Ristretto point.
//! Content keys are wrapped per authorized user with an ECDH envelope
//! against a share-level ephemeral point, and a Schnorr proof lets a user
//! demonstrate knowledge of the identifier behind a commitment without
//! revealing it.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use super::aead;
use crate::{Error, Result};

const SCALAR_DOMAIN: &[u8] = b"usenetsync/commitment/v1";
const WRAP_DOMAIN: &[u8] = b"usenetsync/key-wrap/v1";
const PROOF_DOMAIN: &[u8] = b"usenetsync/pok/v1";

/// Derive the secret scalar for a user identifier.
fn user_scalar(user_id: &str) -> Zeroizing<Scalar> {
    let mut hasher = Sha512::new();
    hasher.update(SCALAR_DOMAIN);
    hasher.update(user_id.as_bytes());
    Zeroizing::new(Scalar::from_hash(hasher))
}

fn decompress(bytes: &[u8], what: &str) -> Result<RistrettoPoint> {
    let compressed = CompressedRistretto::from_slice(bytes)
        .map_err(|_| Error::crypto(format!("{} has wrong length", what)))?;
    compressed
        .decompress()
        .ok_or_else(|| Error::crypto(format!("{} is not a valid point", what)))
}

fn wrap_key_bytes(shared: &RistrettoPoint) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(WRAP_DOMAIN);
    hasher.update(shared.compress().as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

/// Commitment point for a user identifier, 32 bytes. Stored on the share;
/// the identifier itself never is.
pub fn commitment(user_id: &str) -> [u8; 32] {
    let x = user_scalar(user_id);
    (*x * RISTRETTO_BASEPOINT_POINT).compress().to_bytes()
}

/// Wraps one share's content key for each authorized commitment under a
/// single share-level ephemeral point.
pub struct KeyWrapper {
    ephemeral: Zeroizing<Scalar>,
    public: [u8; 32],
}

impl KeyWrapper {
    pub fn new() -> Self {
        let e = Zeroizing::new(Scalar::random(&mut OsRng));
        let public = (*e * RISTRETTO_BASEPOINT_POINT).compress().to_bytes();
        KeyWrapper {
            ephemeral: e,
            public,
        }
    }

    /// Ephemeral public point stored on the share row.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Wrap `content_key` so only the holder of the identifier behind
    /// `commitment` can unwrap it.
    pub fn wrap(&self, commitment: &[u8], content_key: &[u8; 32]) -> Result<Vec<u8>> {
        let c = decompress(commitment, "commitment")?;
        let shared = *self.ephemeral * c;
        aead::seal(&wrap_key_bytes(&shared), content_key, b"wrapped-content-key")
    }
}

impl Default for KeyWrapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwrap a content key using the identifier the commitment was made over.
///
/// Fails as a crypto error for any identifier that does not match: a wrong
/// or revoked user learns nothing beyond "no access".
pub fn unwrap_key(user_id: &str, ephemeral: &[u8], wrapped: &[u8]) -> Result<[u8; 32]> {
    let x = user_scalar(user_id);
    let e_pub = decompress(ephemeral, "ephemeral point")?;
    let shared = *x * e_pub;
    let key = aead::open(&wrap_key_bytes(&shared), wrapped, b"wrapped-content-key")
        .map_err(|_| Error::crypto("content key unwrap failed"))?;
    key.as_slice()
        .try_into()
        .map_err(|_| Error::crypto("unwrapped key has wrong length"))
}

/// Schnorr proof of knowledge of the identifier behind a commitment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub nonce_point: [u8; 32],
    pub response: [u8; 32],
}

fn challenge(nonce_point: &[u8; 32], commitment: &[u8], context: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(PROOF_DOMAIN);
    hasher.update(nonce_point);
    hasher.update(commitment);
    hasher.update(context);
    Scalar::from_hash(hasher)
}

/// Prove knowledge of `user_id`'s scalar for its commitment, bound to
/// `context` (typically the share id).
pub fn prove(user_id: &str, context: &[u8]) -> Proof {
    let x = user_scalar(user_id);
    let c_bytes = (*x * RISTRETTO_BASEPOINT_POINT).compress().to_bytes();

    let r = Zeroizing::new(Scalar::random(&mut OsRng));
    let nonce_point = (*r * RISTRETTO_BASEPOINT_POINT).compress().to_bytes();
    let c = challenge(&nonce_point, &c_bytes, context);
    let response = (*r + c * *x).to_bytes();

    Proof {
        nonce_point,
        response,
    }
}

/// Verify a proof against a stored commitment without learning anything
/// about the identifier.
pub fn verify(commitment: &[u8], proof: &Proof, context: &[u8]) -> Result<()> {
    let c_point = decompress(commitment, "commitment")?;
    let nonce = decompress(&proof.nonce_point, "proof nonce")?;
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(proof.response))
        .ok_or_else(|| Error::crypto("proof response is not canonical"))?;

    let c = challenge(&proof.nonce_point, commitment, context);
    if s * RISTRETTO_BASEPOINT_POINT != nonce + c * c_point {
        return Err(Error::crypto("proof of knowledge rejected"));
    }
    Ok(())
}
