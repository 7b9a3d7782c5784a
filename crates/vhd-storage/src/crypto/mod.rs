//! Sector encryption keys: keyfile discovery, keyhash verification, the keystore and the
//! AES-XTS sector cipher.

mod cipher;
mod keydir;
mod keyhash;
mod keystore;

use std::fmt;

use zeroize::Zeroizing;

use crate::{Result, VhdError};

pub use cipher::SectorCipher;
pub use keydir::{keyfile_stem, KeyDirs, KEYDIR_ENV};
pub use keyhash::{check_key, KeyHash, KEYHASH_HASH_LEN, KEYHASH_NONCE_LEN};
pub use keystore::Keystore;

/// Supported AES-XTS key lengths in bits, most preferred first.
pub const KEY_SIZES: [u32; 2] = [512, 256];

/// AES-XTS key material. The bytes are wiped when the key is dropped.
#[derive(Clone)]
pub struct Key {
    bytes: Zeroizing<Vec<u8>>,
}

impl Key {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let bytes = Zeroizing::new(bytes);
        if !KEY_SIZES.iter().any(|bits| *bits as usize / 8 == bytes.len()) {
            return Err(VhdError::InvalidKey("key must be 256 or 512 bits"));
        }
        Ok(Self { bytes })
    }

    pub fn bits(&self) -> u32 {
        self.bytes.len() as u32 * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("bits", &self.bits()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_lengths_are_validated() {
        assert_eq!(Key::new(vec![0; 64]).unwrap().bits(), 512);
        assert_eq!(Key::new(vec![0; 32]).unwrap().bits(), 256);
        assert!(matches!(
            Key::new(vec![0; 16]).unwrap_err(),
            VhdError::InvalidKey(_)
        ));
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = Key::new(vec![0xab; 32]).unwrap();
        let s = format!("{key:?}");
        assert!(!s.contains("171"));
        assert!(s.contains("256"));
    }
}
