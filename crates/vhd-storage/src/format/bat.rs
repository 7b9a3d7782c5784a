use crate::util::{align_up_u64, be_u32};
use crate::{Result, VhdError, SECTOR_SIZE};

/// BAT entry value for a block without backing storage.
pub const BAT_UNUSED: u32 = u32::MAX;

/// Block allocation table: one sector offset per virtual block.
///
/// Every access is bounds-checked; an allocated entry is never reassigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bat {
    entries: Vec<u32>,
}

impl Bat {
    pub fn new_unused(len: u32) -> Self {
        Self {
            entries: vec![BAT_UNUSED; len as usize],
        }
    }

    pub fn parse(raw: &[u8], len: u32) -> Result<Self> {
        let bytes = (len as usize)
            .checked_mul(4)
            .ok_or(VhdError::OffsetOverflow)?;
        if raw.len() < bytes {
            return Err(VhdError::Corrupt("bat truncated"));
        }
        Ok(Self {
            entries: raw[..bytes].chunks_exact(4).map(be_u32).collect(),
        })
    }

    /// Serialized table, padded with unused entries to a whole sector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let padded = Self::disk_size(self.len())?;
        let mut out = vec![0xffu8; padded as usize];
        for (chunk, entry) in out.chunks_exact_mut(4).zip(&self.entries) {
            chunk.copy_from_slice(&entry.to_be_bytes());
        }
        Ok(out)
    }

    /// Bytes occupied on disk by a table of `len` entries.
    pub fn disk_size(len: u32) -> Result<u64> {
        align_up_u64(len as u64 * 4, SECTOR_SIZE as u64)
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sector offset of `block`, or `None` when unallocated.
    pub fn get(&self, block: u32) -> Result<Option<u32>> {
        match self.entries.get(block as usize) {
            Some(&BAT_UNUSED) => Ok(None),
            Some(&sector) => Ok(Some(sector)),
            None => Err(VhdError::Corrupt("block index beyond bat")),
        }
    }

    pub fn set(&mut self, block: u32, sector: u32) -> Result<()> {
        if sector == BAT_UNUSED {
            return Err(VhdError::InvalidArgument(
                "bat entries cannot be released".into(),
            ));
        }
        let entry = self
            .entries
            .get_mut(block as usize)
            .ok_or(VhdError::Corrupt("block index beyond bat"))?;
        if *entry != BAT_UNUSED && *entry != sector {
            return Err(VhdError::InvalidState(format!(
                "block {block} is already allocated at sector {entry}"
            )));
        }
        *entry = sector;
        Ok(())
    }

    /// Marks every entry unused, e.g. before rebuilding a table for a new layout.
    pub fn reset(&mut self) {
        self.entries.fill(BAT_UNUSED);
    }

    pub fn allocated(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| **e != BAT_UNUSED)
            .map(|(i, e)| (i as u32, *e))
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated().count() as u64
    }

    /// Allocated `(block, sector)` pairs ordered by physical position, then block index.
    pub fn physical_order(&self) -> Vec<(u32, u32)> {
        let mut v: Vec<(u32, u32)> = self.allocated().collect();
        v.sort_by_key(|&(block, sector)| (sector, block));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_write_once() {
        let mut bat = Bat::new_unused(4);
        bat.set(1, 100).unwrap();
        bat.set(1, 100).unwrap();
        assert!(matches!(bat.set(1, 200).unwrap_err(), VhdError::InvalidState(_)));
        assert!(bat.set(1, BAT_UNUSED).is_err());
        assert_eq!(bat.get(1).unwrap(), Some(100));
        assert_eq!(bat.get(0).unwrap(), None);
        assert!(bat.get(4).is_err());
    }

    #[test]
    fn physical_order_sorts_by_sector() {
        let mut bat = Bat::new_unused(4);
        bat.set(0, 300).unwrap();
        bat.set(2, 100).unwrap();
        bat.set(3, 200).unwrap();
        assert_eq!(bat.physical_order(), vec![(2, 100), (3, 200), (0, 300)]);
        assert_eq!(bat.allocated_count(), 3);
    }

    #[test]
    fn serialized_table_is_sector_padded() {
        let mut bat = Bat::new_unused(3);
        bat.set(0, 7).unwrap();
        let raw = bat.to_bytes().unwrap();
        assert_eq!(raw.len(), 512);
        assert_eq!(&raw[..4], &7u32.to_be_bytes());
        assert!(raw[4..].iter().all(|b| *b == 0xff));
        assert_eq!(Bat::parse(&raw, 3).unwrap(), bat);
    }
}
