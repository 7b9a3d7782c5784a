use crate::crypto::KeyHash;
use crate::util::{be_u32, be_u64, bytes_to_sectors, put_be_u32, put_be_u64};
use crate::{Result, VhdError, SECTOR_SIZE};

const BATMAP_COOKIE: [u8; 8] = *b"tdbatmap";
const KEYHASH_OFFSET: usize = 32;

pub const BATMAP_VERSION: u32 = 0x0001_0002;

/// Sector immediately following the BAT that locates the batmap and carries the keyhash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatmapHeader {
    /// Byte offset of the map.
    pub batmap_offset: u64,
    /// Size of the map in sectors.
    pub batmap_size: u32,
    pub version: u32,
    pub checksum: u32,
    pub marker: u8,
    pub keyhash: KeyHash,
}

impl BatmapHeader {
    /// Parses the header sector; `None` when the cookie is absent.
    pub fn parse(raw: &[u8; SECTOR_SIZE]) -> Result<Option<Self>> {
        if raw[..8] != BATMAP_COOKIE {
            return Ok(None);
        }
        let version = be_u32(&raw[20..]);
        if version >> 16 != 1 {
            return Err(VhdError::Unsupported("batmap version"));
        }
        Ok(Some(Self {
            batmap_offset: be_u64(&raw[8..]),
            batmap_size: be_u32(&raw[16..]),
            version,
            checksum: be_u32(&raw[24..]),
            marker: raw[28],
            keyhash: KeyHash::parse(&raw[KEYHASH_OFFSET..KEYHASH_OFFSET + KeyHash::DISK_SIZE]),
        }))
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[..8].copy_from_slice(&BATMAP_COOKIE);
        put_be_u64(&mut raw, 8, self.batmap_offset);
        put_be_u32(&mut raw, 16, self.batmap_size);
        put_be_u32(&mut raw, 20, self.version);
        put_be_u32(&mut raw, 24, self.checksum);
        raw[28] = self.marker;
        self.keyhash
            .write(&mut raw[KEYHASH_OFFSET..KEYHASH_OFFSET + KeyHash::DISK_SIZE]);
        raw
    }
}

/// One bit per block, set once every sector of the block is allocated. Bits are MSB-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batmap {
    pub header: BatmapHeader,
    map: Vec<u8>,
}

impl Batmap {
    /// Empty batmap for `blocks` blocks whose map starts at byte `batmap_offset`.
    pub fn new(batmap_offset: u64, blocks: u32) -> Self {
        let sectors = bytes_to_sectors((blocks as u64).div_ceil(8)).max(1);
        let map = vec![0u8; sectors as usize * SECTOR_SIZE];
        let header = BatmapHeader {
            batmap_offset,
            batmap_size: sectors as u32,
            version: BATMAP_VERSION,
            checksum: map_checksum(&map),
            marker: 0,
            keyhash: KeyHash::default(),
        };
        Self { header, map }
    }

    /// Pairs a parsed header with its map, verifying the map checksum.
    pub fn from_parts(header: BatmapHeader, map: Vec<u8>) -> Result<Self> {
        let computed = map_checksum(&map);
        if computed != header.checksum {
            return Err(VhdError::ChecksumMismatch {
                what: "batmap",
                stored: header.checksum,
                computed,
            });
        }
        Ok(Self { header, map })
    }

    pub fn map_bytes(&self) -> u64 {
        self.header.batmap_size as u64 * SECTOR_SIZE as u64
    }

    pub fn map(&self) -> &[u8] {
        &self.map
    }

    pub fn test(&self, block: u32) -> bool {
        self.map
            .get(block as usize / 8)
            .is_some_and(|b| b & (0x80 >> (block % 8)) != 0)
    }

    /// Sets the bit for `block` and refreshes the checksum; returns the byte index touched.
    pub fn set(&mut self, block: u32) -> Result<usize> {
        let idx = block as usize / 8;
        let byte = self
            .map
            .get_mut(idx)
            .ok_or(VhdError::Corrupt("block index beyond batmap"))?;
        *byte |= 0x80 >> (block % 8);
        self.header.checksum = map_checksum(&self.map);
        Ok(idx)
    }

    pub fn clear_all(&mut self) {
        self.map.fill(0);
        self.header.checksum = map_checksum(&self.map);
    }
}

fn map_checksum(map: &[u8]) -> u32 {
    let sum = map
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
    !sum
}
