use std::fmt::Write as _;

use uuid::Uuid;

use super::footer::num;
use crate::util::{be_u32, be_u64, put_be_u32, put_be_u64, vhd_checksum};
use crate::{Result, VhdError, SECTOR_SIZE};

pub const HEADER_SIZE: usize = 1024;
pub const PARENT_LOCATOR_COUNT: usize = 8;

const HEADER_COOKIE: [u8; 8] = *b"cxsparse";
const CHECKSUM_OFFSET: usize = 36;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_LEN: usize = 512;
const LOCATOR_OFFSET: usize = 576;
const LOCATOR_SIZE: usize = 24;
const RESERVED2_OFFSET: usize = 768;

/// Platform code of a parent locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorCode {
    None,
    /// Absolute Windows path, UTF-16LE.
    W2ku,
    /// Relative Windows path, UTF-16LE.
    W2ru,
    /// File URL, UTF-8.
    Macx,
    Other(u32),
}

impl LocatorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => LocatorCode::None,
            0x5732_6B75 => LocatorCode::W2ku,
            0x5732_7275 => LocatorCode::W2ru,
            0x4D61_6358 => LocatorCode::Macx,
            c => LocatorCode::Other(c),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            LocatorCode::None => 0,
            LocatorCode::W2ku => 0x5732_6B75,
            LocatorCode::W2ru => 0x5732_7275,
            LocatorCode::Macx => 0x4D61_6358,
            LocatorCode::Other(c) => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLocator {
    pub code: LocatorCode,
    pub data_space: u32,
    pub data_len: u32,
    pub reserved: u32,
    pub data_offset: u64,
}

impl ParentLocator {
    pub const EMPTY: ParentLocator = ParentLocator {
        code: LocatorCode::None,
        data_space: 0,
        data_len: 0,
        reserved: 0,
        data_offset: 0,
    };

    pub fn is_used(&self) -> bool {
        self.code != LocatorCode::None
    }

    /// Bytes reserved for the locator data. Legacy writers stored `data_space` in sectors;
    /// values below one sector are read that way.
    pub fn space_bytes(&self) -> u64 {
        let space = self.data_space as u64;
        if space < SECTOR_SIZE as u64 {
            space * SECTOR_SIZE as u64
        } else if space.is_multiple_of(SECTOR_SIZE as u64) {
            space
        } else {
            0
        }
    }

    fn parse(raw: &[u8]) -> Self {
        Self {
            code: LocatorCode::from_u32(be_u32(&raw[0..])),
            data_space: be_u32(&raw[4..]),
            data_len: be_u32(&raw[8..]),
            reserved: be_u32(&raw[12..]),
            data_offset: be_u64(&raw[16..]),
        }
    }

    fn write(&self, raw: &mut [u8]) {
        put_be_u32(raw, 0, self.code.to_u32());
        put_be_u32(raw, 4, self.data_space);
        put_be_u32(raw, 8, self.data_len);
        put_be_u32(raw, 12, self.reserved);
        put_be_u64(raw, 16, self.data_offset);
    }
}

/// 1024-byte sparse header describing the BAT and the parent of a differencing image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_bat_size: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: Uuid,
    pub parent_timestamp: u32,
    reserved1: u32,
    parent_name: Vec<u8>,
    pub locators: [ParentLocator; PARENT_LOCATOR_COUNT],
    reserved2: Vec<u8>,
}

impl Header {
    pub fn new(table_offset: u64, max_bat_size: u32, block_size: u32) -> Self {
        Self {
            data_offset: u64::MAX,
            table_offset,
            header_version: super::VHD_VERSION_1_0,
            max_bat_size,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            reserved1: 0,
            parent_name: vec![0; PARENT_NAME_LEN],
            locators: [ParentLocator::EMPTY; PARENT_LOCATOR_COUNT],
            reserved2: vec![0; HEADER_SIZE - RESERVED2_OFFSET],
        }
    }

    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if raw[..8] != HEADER_COOKIE {
            return Err(VhdError::NotVhd("header cookie mismatch"));
        }

        let stored = be_u32(&raw[CHECKSUM_OFFSET..]);
        let computed = vhd_checksum(raw, CHECKSUM_OFFSET);
        if stored != computed {
            return Err(VhdError::ChecksumMismatch {
                what: "header",
                stored,
                computed,
            });
        }

        let table_offset = be_u64(&raw[16..]);
        let max_bat_size = be_u32(&raw[28..]);
        let block_size = be_u32(&raw[32..]);
        if !table_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::Corrupt("bat offset misaligned"));
        }
        if block_size == 0 || !block_size.is_power_of_two() || (block_size as usize) < SECTOR_SIZE
        {
            return Err(VhdError::Corrupt("block size invalid"));
        }

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&raw[40..56]);

        let mut locators = [ParentLocator::EMPTY; PARENT_LOCATOR_COUNT];
        for (i, loc) in locators.iter_mut().enumerate() {
            let off = LOCATOR_OFFSET + i * LOCATOR_SIZE;
            *loc = ParentLocator::parse(&raw[off..off + LOCATOR_SIZE]);
        }

        Ok(Self {
            data_offset: be_u64(&raw[8..]),
            table_offset,
            header_version: be_u32(&raw[24..]),
            max_bat_size,
            block_size,
            checksum: stored,
            parent_uuid: Uuid::from_bytes(parent_uuid),
            parent_timestamp: be_u32(&raw[56..]),
            reserved1: be_u32(&raw[60..]),
            parent_name: raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_LEN].to_vec(),
            locators,
            reserved2: raw[RESERVED2_OFFSET..].to_vec(),
        })
    }

    /// Serializes the header, recomputing (and recording) its checksum.
    pub fn to_bytes(&mut self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..8].copy_from_slice(&HEADER_COOKIE);
        put_be_u64(&mut raw, 8, self.data_offset);
        put_be_u64(&mut raw, 16, self.table_offset);
        put_be_u32(&mut raw, 24, self.header_version);
        put_be_u32(&mut raw, 28, self.max_bat_size);
        put_be_u32(&mut raw, 32, self.block_size);
        raw[40..56].copy_from_slice(self.parent_uuid.as_bytes());
        put_be_u32(&mut raw, 56, self.parent_timestamp);
        put_be_u32(&mut raw, 60, self.reserved1);
        let n = self.parent_name.len().min(PARENT_NAME_LEN);
        raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + n].copy_from_slice(&self.parent_name[..n]);
        for (i, loc) in self.locators.iter().enumerate() {
            let off = LOCATOR_OFFSET + i * LOCATOR_SIZE;
            loc.write(&mut raw[off..off + LOCATOR_SIZE]);
        }
        let n = self.reserved2.len().min(HEADER_SIZE - RESERVED2_OFFSET);
        raw[RESERVED2_OFFSET..RESERVED2_OFFSET + n].copy_from_slice(&self.reserved2[..n]);

        self.checksum = vhd_checksum(&raw, CHECKSUM_OFFSET);
        put_be_u32(&mut raw, CHECKSUM_OFFSET, self.checksum);
        raw
    }

    /// Parent file name recorded in the header (UTF-16BE, NUL terminated).
    pub fn parent_name(&self) -> String {
        let units: Vec<u16> = self
            .parent_name
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let mut raw = vec![0u8; PARENT_NAME_LEN];
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() * 2 > PARENT_NAME_LEN {
            return Err(VhdError::InvalidArgument(format!(
                "parent name {name:?} is too long"
            )));
        }
        for (i, u) in units.iter().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&u.to_be_bytes());
        }
        self.parent_name = raw;
        Ok(())
    }

    pub fn describe(&self, hex: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "VHD Header Summary:");
        let _ = writeln!(out, "-------------------");
        let _ = writeln!(out, "Cookie              : cxsparse");
        let _ = writeln!(out, "Data offset (unusd) : {}", num(self.data_offset, hex));
        let _ = writeln!(out, "Table offset        : {}", num(self.table_offset, hex));
        let _ = writeln!(
            out,
            "Header version      : {:#010x}",
            self.header_version
        );
        let _ = writeln!(
            out,
            "Max BAT size        : {}",
            num(self.max_bat_size as u64, hex)
        );
        let _ = writeln!(out, "Block size          : {}", num(self.block_size as u64, hex));
        let _ = writeln!(out, "Parent name         : {}", self.parent_name());
        let _ = writeln!(out, "Parent UUID         : {}", self.parent_uuid);
        let _ = writeln!(
            out,
            "Parent timestamp    : {}",
            num(self.parent_timestamp as u64, hex)
        );
        let _ = writeln!(out, "Checksum            : {:#010x}", self.checksum);
        for (i, loc) in self.locators.iter().enumerate().filter(|(_, l)| l.is_used()) {
            let _ = writeln!(
                out,
                "Parent locator {i}    : code {:#010x}, space {}, len {}, offset {}",
                loc.code.to_u32(),
                num(loc.data_space as u64, hex),
                num(loc.data_len as u64, hex),
                num(loc.data_offset, hex)
            );
        }
        out
    }
}
