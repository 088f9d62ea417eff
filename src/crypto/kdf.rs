//! Password key derivation
//!
//! Argon2id with parameters auto-tuned at first run toward the configured
//! target cost. Derivation that blows through the hard ceiling is a crypto
//! error, not a silent stall.

use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SALT_LEN: usize = 16;

/// Hard ceiling on one derivation; parameters tune down on older hardware.
pub const KDF_CEILING: Duration = Duration::from_secs(2);

const MIN_M_COST_KIB: u32 = 8 * 1024;

/// Tuned Argon2id parameters, persisted with the material they protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests; never used for real material.
    pub fn test() -> Self {
        Self {
            m_cost_kib: MIN_M_COST_KIB,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

/// Generate a fresh random 128-bit salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| Error::crypto(format!("rng failure: {}", e)))?;
    Ok(salt)
}

/// Derive a 256-bit key from `secret` under `params`.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| Error::crypto(format!("invalid KDF parameters: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let started = Instant::now();
    let mut out = [0u8; 32];
    argon
        .hash_password_into(secret, salt, &mut out)
        .map_err(|e| Error::crypto(format!("key derivation failed: {}", e)))?;

    if started.elapsed() > KDF_CEILING {
        return Err(Error::crypto(format!(
            "key derivation exceeded {}ms ceiling; re-tune parameters",
            KDF_CEILING.as_millis()
        )));
    }
    Ok(out)
}

/// Measure this host and pick parameters that land near `target_ms`.
///
/// Starts from the defaults and halves memory cost until the measured
/// derivation fits the target, bottoming out at 8 MiB.
pub fn auto_tune(target_ms: u64) -> Result<KdfParams> {
    let target = Duration::from_millis(target_ms.min(KDF_CEILING.as_millis() as u64));
    let salt = generate_salt()?;
    let mut params = KdfParams::default();

    loop {
        let started = Instant::now();
        let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
            .map_err(|e| Error::crypto(format!("invalid KDF parameters: {}", e)))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
        let mut probe = [0u8; 32];
        argon
            .hash_password_into(b"tuning probe", &salt, &mut probe)
            .map_err(|e| Error::crypto(format!("key derivation failed: {}", e)))?;
        let elapsed = started.elapsed();

        if elapsed <= target || params.m_cost_kib <= MIN_M_COST_KIB {
            tracing::info!(
                m_cost_kib = params.m_cost_kib,
                t_cost = params.t_cost,
                elapsed_ms = elapsed.as_millis() as u64,
                "KDF parameters tuned"
            );
            return Ok(params);
        }
        params.m_cost_kib = (params.m_cost_kib / 2).max(MIN_M_COST_KIB);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let salt = [1u8; SALT_LEN];
        let a = derive_key(b"correct horse battery staple", &salt, &KdfParams::test()).unwrap();
        let b = derive_key(b"correct horse battery staple", &salt, &KdfParams::test()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_password_differs() {
        let salt = [1u8; SALT_LEN];
        let a = derive_key(b"correct horse battery staple", &salt, &KdfParams::test()).unwrap();
        let b = derive_key(b"incorrect horse battery staple", &salt, &KdfParams::test()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_matters() {
        let a = derive_key(b"pw", &[1u8; SALT_LEN], &KdfParams::test()).unwrap();
        let b = derive_key(b"pw", &[2u8; SALT_LEN], &KdfParams::test()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_auto_tune_terminates() {
        let params = auto_tune(50).unwrap();
        assert!(params.m_cost_kib >= MIN_M_COST_KIB);
    }
}
