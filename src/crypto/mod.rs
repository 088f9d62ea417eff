//! Crypto kernel
//!
//! Every cryptographic operation the engine performs lives here: AEAD
//! sealing, streaming encryption, password derivation, folder keypairs,
//! subject/message-id obfuscation, and the commitment scheme behind
//! private shares. No other module touches a primitive directly.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

pub mod aead;
pub mod commit;
pub mod kdf;
pub mod keys;
pub mod obfuscate;
pub mod stream;

pub use kdf::KdfParams;
pub use keys::FolderKeys;

/// Symmetric key length used everywhere (256-bit).
pub const KEY_LEN: usize = 32;

/// Store-level master key. Derived once from the operator secret; all
/// private material at rest is sealed under it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey(bytes)
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// The kernel: owns the master key and the tuned KDF parameters.
pub struct CryptoKernel {
    master: MasterKey,
    kdf_params: KdfParams,
}

impl CryptoKernel {
    /// Build a kernel from an already-derived master key.
    ///
    /// Refuses to start when the operating system cannot supply
    /// cryptographic randomness.
    pub fn new(master: MasterKey, kdf_params: KdfParams) -> Result<Self> {
        let mut probe = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| Error::crypto(format!("no OS randomness source: {}", e)))?;
        probe.zeroize();
        Ok(Self { master, kdf_params })
    }

    /// Derive the master key from the operator secret and open the kernel.
    pub fn open(secret: &[u8], salt: &[u8], kdf_params: KdfParams) -> Result<Self> {
        let master = kdf::derive_key(secret, salt, &kdf_params)?;
        Self::new(MasterKey::from_bytes(master), kdf_params)
    }

    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf_params
    }

    /// Seal bytes for at-rest storage (private keys, article references,
    /// server credentials).
    pub fn seal_at_rest(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead::seal(self.master.bytes(), plaintext, b"at-rest")
    }

    pub fn open_at_rest(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        aead::open(self.master.bytes(), sealed, b"at-rest")
    }

    /// Per-(folder, version) content key. Each folder gets its own content
    /// root derived from the master key; the per-version key expands from
    /// that root, so no two folders ever share derivation material.
    pub fn content_key(&self, folder_id: &str, version: u64) -> [u8; KEY_LEN] {
        let root = keys::derive_subkey(self.master.bytes(), b"content-root", folder_id.as_bytes());
        let info = format!("{}:{}", folder_id, version);
        keys::derive_subkey(&root, b"content-key", info.as_bytes())
    }

    /// Mint the permanent operator identifier: 256 bits of OS randomness,
    /// hex encoded. Returned once; never regenerated.
    pub fn mint_user_id(&self) -> Result<String> {
        let mut raw = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|e| Error::crypto(format!("rng failure: {}", e)))?;
        Ok(hex::encode(raw))
    }

    /// Generate a fresh 256-bit content key for a share.
    pub fn mint_content_key(&self) -> Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| Error::crypto(format!("rng failure: {}", e)))?;
        Ok(key)
    }
}
