use rand::RngCore;
use sha2::{Digest, Sha256};

use super::Key;
use crate::{Result, VhdError};

pub const KEYHASH_NONCE_LEN: usize = 32;
pub const KEYHASH_HASH_LEN: usize = 32;

/// Key fingerprint stored with an encrypted image: `SHA-256(key || nonce)`.
///
/// A zero cookie means the image is not encrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyHash {
    pub cookie: u8,
    pub nonce: [u8; KEYHASH_NONCE_LEN],
    pub hash: [u8; KEYHASH_HASH_LEN],
}

impl KeyHash {
    pub const DISK_SIZE: usize = 1 + KEYHASH_NONCE_LEN + KEYHASH_HASH_LEN;

    pub fn calculate(key: &[u8], nonce: [u8; KEYHASH_NONCE_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        Self {
            cookie: 1,
            nonce,
            hash: hasher.finalize().into(),
        }
    }

    /// Fingerprint of `key` under a fresh random nonce.
    pub fn generate(key: &Key) -> Self {
        let mut nonce = [0u8; KEYHASH_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::calculate(key.as_bytes(), nonce)
    }

    pub fn is_present(&self) -> bool {
        self.cookie != 0
    }

    pub(crate) fn parse(raw: &[u8]) -> Self {
        let mut nonce = [0u8; KEYHASH_NONCE_LEN];
        let mut hash = [0u8; KEYHASH_HASH_LEN];
        nonce.copy_from_slice(&raw[1..1 + KEYHASH_NONCE_LEN]);
        hash.copy_from_slice(&raw[1 + KEYHASH_NONCE_LEN..Self::DISK_SIZE]);
        Self {
            cookie: raw[0],
            nonce,
            hash,
        }
    }

    pub(crate) fn write(&self, raw: &mut [u8]) {
        raw[0] = self.cookie;
        raw[1..1 + KEYHASH_NONCE_LEN].copy_from_slice(&self.nonce);
        raw[1 + KEYHASH_NONCE_LEN..Self::DISK_SIZE].copy_from_slice(&self.hash);
    }

    pub fn hash_hex(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Verifies that `key` hashes to `keyhash` under the stored nonce.
pub fn check_key(key: &Key, keyhash: &KeyHash) -> Result<()> {
    if !keyhash.is_present() {
        return Err(VhdError::NoKey("image without keyhash".into()));
    }
    let computed = KeyHash::calculate(key.as_bytes(), keyhash.nonce);
    let diff = computed
        .hash
        .iter()
        .zip(&keyhash.hash)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff != 0 {
        tracing::debug!("key hash mismatch");
        return Err(VhdError::BadKey);
    }
    Ok(())
}
