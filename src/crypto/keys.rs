//! Keypairs and key derivation
//!
//! Folder keypairs are Ed25519, generated once at folder creation and never
//! rotated. Signing keys live encrypted at rest under the master key; this
//! module is the only place they exist decrypted, and buffers are zeroized
//! when handles drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::CryptoKernel;
use crate::{Error, Result};

pub const SIGNATURE_LEN: usize = 64;

/// A folder's signing identity, held decrypted only inside this handle.
pub struct FolderKeys {
    signing: SigningKey,
}

impl FolderKeys {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        FolderKeys {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Verifying key bytes as stored on the folder row.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Seal the signing key for at-rest storage.
    pub fn seal(&self, kernel: &CryptoKernel) -> Result<Vec<u8>> {
        kernel.seal_at_rest(&self.signing.to_bytes())
    }

    /// Reopen a sealed signing key.
    pub fn unseal(kernel: &CryptoKernel, sealed: &[u8]) -> Result<Self> {
        let raw = Zeroizing::new(kernel.open_at_rest(sealed)?);
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::crypto("sealed signing key has wrong length"))?;
        Ok(FolderKeys {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Secret bytes for deterministic derivations (internal subjects).
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

/// Verify a folder signature against stored verifying-key bytes.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| Error::crypto("verifying key has wrong length"))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::crypto("malformed verifying key"))?;
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| Error::integrity("signature has wrong length"))?;
    verifying
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| Error::integrity("signature verification failed"))
}

/// HKDF-SHA256 subkey derivation: `salt` labels the usage domain, `info`
/// binds the derivation coordinates.
pub fn derive_subkey(key: &[u8; 32], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), key);
    let mut out = [0u8; 32];
    // Only fails for absurd output lengths; 32 bytes is always valid.
    hk.expand(info, &mut out).expect("hkdf output length");
    out
}
