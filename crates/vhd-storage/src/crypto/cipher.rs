use aes::cipher::KeyInit;
use aes::{Aes128, Aes256};
use xts_mode::{get_tweak_default, Xts128};

use super::Key;
use crate::{Result, VhdError, SECTOR_SIZE};

enum Xts {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

/// AES-XTS over 512-byte sectors with the "plain" IV: the tweak is the low 32 bits of
/// the logical sector number, little-endian.
///
/// A 256-bit key selects AES-128-XTS, a 512-bit key AES-256-XTS.
pub struct SectorCipher {
    xts: Xts,
}

impl std::fmt::Debug for SectorCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.xts {
            Xts::Aes128(_) => "aes-128-xts-plain",
            Xts::Aes256(_) => "aes-256-xts-plain",
        };
        f.debug_tuple("SectorCipher").field(&mode).finish()
    }
}

impl SectorCipher {
    pub fn new(key: &Key) -> Result<Self> {
        let bytes = key.as_bytes();
        let (k1, k2) = bytes.split_at(bytes.len() / 2);
        let bad = |_| VhdError::InvalidKey("aes key setup failed");
        let xts = match key.bits() {
            256 => Xts::Aes128(Xts128::new(
                Aes128::new_from_slice(k1).map_err(bad)?,
                Aes128::new_from_slice(k2).map_err(bad)?,
            )),
            512 => Xts::Aes256(Xts128::new(
                Aes256::new_from_slice(k1).map_err(bad)?,
                Aes256::new_from_slice(k2).map_err(bad)?,
            )),
            _ => return Err(VhdError::InvalidKey("key must be 256 or 512 bits")),
        };
        Ok(Self { xts })
    }

    /// Encrypts whole sectors in place; `first_sector` is the logical sector of `buf[0]`.
    pub fn encrypt(&self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        check_area(first_sector, buf)?;
        let first = first_sector as u128;
        match &self.xts {
            Xts::Aes128(x) => x.encrypt_area(buf, SECTOR_SIZE, first, plain_tweak),
            Xts::Aes256(x) => x.encrypt_area(buf, SECTOR_SIZE, first, plain_tweak),
        }
        Ok(())
    }

    pub fn decrypt(&self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        check_area(first_sector, buf)?;
        let first = first_sector as u128;
        match &self.xts {
            Xts::Aes128(x) => x.decrypt_area(buf, SECTOR_SIZE, first, plain_tweak),
            Xts::Aes256(x) => x.decrypt_area(buf, SECTOR_SIZE, first, plain_tweak),
        }
        Ok(())
    }
}

fn check_area(first_sector: u64, buf: &[u8]) -> Result<()> {
    if !buf.len().is_multiple_of(SECTOR_SIZE) {
        return Err(VhdError::Cipher {
            sector: first_sector,
            reason: "buffer is not a whole number of sectors",
        });
    }
    Ok(())
}

fn plain_tweak(sector: u128) -> [u8; 16] {
    get_tweak_default(sector & 0xffff_ffff)
}
