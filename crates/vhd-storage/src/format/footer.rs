use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::util::{be_u32, be_u64, put_be_u32, put_be_u64, vhd_checksum};
use crate::{Result, VhdError, SECTOR_SIZE};

pub const FOOTER_SIZE: usize = 512;

const FOOTER_COOKIE: [u8; 8] = *b"conectix";
const CHECKSUM_OFFSET: usize = 64;
const RESERVED_OFFSET: usize = 86;

// Seconds between the unix epoch and 2000-01-01T00:00:00Z.
const VHD_EPOCH_OFFSET: u64 = 946_684_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn code(self) -> u32 {
        match self {
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Differencing => 4,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            _ => Err(VhdError::Unsupported("vhd disk type")),
        }
    }

    /// Dynamic and differencing images share the sparse layout.
    pub fn is_sparse(self) -> bool {
        !matches!(self, DiskType::Fixed)
    }
}

/// 512-byte identity and size record, stored at the end of the image and (for sparse
/// images) copied at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub features: u32,
    pub format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: u32,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved: u8,
    pub hidden: u8,
    reserved: Vec<u8>,
}

impl Footer {
    pub fn new(disk_type: DiskType, current_size: u64) -> Self {
        Self {
            features: 0x0000_0002,
            format_version: super::VHD_VERSION_1_0,
            data_offset: if disk_type.is_sparse() {
                SECTOR_SIZE as u64
            } else {
                u64::MAX
            },
            timestamp: vhd_time(SystemTime::now()),
            creator_app: super::CREATOR_APP,
            creator_version: super::CREATOR_VERSION,
            creator_os: u32::from_be_bytes(*b"Lnux"),
            original_size: current_size,
            current_size,
            geometry: chs_geometry(current_size / SECTOR_SIZE as u64),
            disk_type,
            checksum: 0,
            uuid: Uuid::new_v4(),
            saved: 0,
            hidden: 0,
            reserved: vec![0; FOOTER_SIZE - RESERVED_OFFSET],
        }
    }

    pub fn parse(raw: &[u8; FOOTER_SIZE]) -> Result<Self> {
        if raw[..8] != FOOTER_COOKIE {
            return Err(VhdError::NotVhd("footer cookie mismatch"));
        }

        let stored = be_u32(&raw[CHECKSUM_OFFSET..]);
        let computed = vhd_checksum(raw, CHECKSUM_OFFSET);
        if stored != computed {
            return Err(VhdError::ChecksumMismatch {
                what: "footer",
                stored,
                computed,
            });
        }

        let format_version = be_u32(&raw[12..]);
        if format_version >> 16 != 1 {
            return Err(VhdError::Unsupported("vhd format version"));
        }

        let current_size = be_u64(&raw[48..]);
        if !current_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::Corrupt("footer current size misaligned"));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&raw[28..32]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[68..84]);

        Ok(Self {
            features: be_u32(&raw[8..]),
            format_version,
            data_offset: be_u64(&raw[16..]),
            timestamp: be_u32(&raw[24..]),
            creator_app,
            creator_version: be_u32(&raw[32..]),
            creator_os: be_u32(&raw[36..]),
            original_size: be_u64(&raw[40..]),
            current_size,
            geometry: be_u32(&raw[56..]),
            disk_type: DiskType::from_code(be_u32(&raw[60..]))?,
            checksum: stored,
            uuid: Uuid::from_bytes(uuid),
            saved: raw[84],
            hidden: raw[85],
            reserved: raw[RESERVED_OFFSET..].to_vec(),
        })
    }

    /// Serializes the footer, recomputing (and recording) its checksum.
    pub fn to_bytes(&mut self) -> [u8; FOOTER_SIZE] {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[..8].copy_from_slice(&FOOTER_COOKIE);
        put_be_u32(&mut raw, 8, self.features);
        put_be_u32(&mut raw, 12, self.format_version);
        put_be_u64(&mut raw, 16, self.data_offset);
        put_be_u32(&mut raw, 24, self.timestamp);
        raw[28..32].copy_from_slice(&self.creator_app);
        put_be_u32(&mut raw, 32, self.creator_version);
        put_be_u32(&mut raw, 36, self.creator_os);
        put_be_u64(&mut raw, 40, self.original_size);
        put_be_u64(&mut raw, 48, self.current_size);
        put_be_u32(&mut raw, 56, self.geometry);
        put_be_u32(&mut raw, 60, self.disk_type.code());
        raw[68..84].copy_from_slice(self.uuid.as_bytes());
        raw[84] = self.saved;
        raw[85] = self.hidden;
        let n = self.reserved.len().min(FOOTER_SIZE - RESERVED_OFFSET);
        raw[RESERVED_OFFSET..RESERVED_OFFSET + n].copy_from_slice(&self.reserved[..n]);

        self.checksum = vhd_checksum(&raw, CHECKSUM_OFFSET);
        put_be_u32(&mut raw, CHECKSUM_OFFSET, self.checksum);
        raw
    }

    pub fn created_by_tap(&self) -> bool {
        self.creator_app == super::CREATOR_APP
    }

    pub fn describe(&self, hex: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "VHD Footer Summary:");
        let _ = writeln!(out, "-------------------");
        let _ = writeln!(out, "Cookie              : conectix");
        let _ = writeln!(out, "Features            : {}", num(self.features as u64, hex));
        let _ = writeln!(
            out,
            "File format version : Major: {}, Minor: {}",
            self.format_version >> 16,
            self.format_version & 0xffff
        );
        let _ = writeln!(out, "Data offset         : {}", num(self.data_offset, hex));
        let _ = writeln!(out, "Timestamp           : {}", num(self.timestamp as u64, hex));
        let _ = writeln!(
            out,
            "Creator Application : '{}'",
            String::from_utf8_lossy(&self.creator_app).trim_end_matches('\0')
        );
        let _ = writeln!(
            out,
            "Creator version     : Major: {}, Minor: {}",
            self.creator_version >> 16,
            self.creator_version & 0xffff
        );
        let _ = writeln!(out, "Original disk size  : {}", num(self.original_size, hex));
        let _ = writeln!(out, "Current disk size   : {}", num(self.current_size, hex));
        let _ = writeln!(
            out,
            "Geometry            : Cyl: {}, Hds: {}, Sctrs: {}",
            self.geometry >> 16,
            (self.geometry >> 8) & 0xff,
            self.geometry & 0xff
        );
        let _ = writeln!(out, "Disk type           : {:?}", self.disk_type);
        let _ = writeln!(out, "Checksum            : {:#010x}", self.checksum);
        let _ = writeln!(out, "UUID                : {}", self.uuid);
        let _ = writeln!(out, "Saved state         : {}", self.saved != 0);
        let _ = writeln!(out, "Hidden              : {}", self.hidden);
        out
    }
}

pub(crate) fn num(v: u64, hex: bool) -> String {
    if hex {
        format!("{v:#x}")
    } else {
        v.to_string()
    }
}

/// Seconds since 2000-01-01T00:00:00Z, saturating at the representable range.
pub fn vhd_time(t: SystemTime) -> u32 {
    let unix = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_OFFSET).min(u32::MAX as u64) as u32
}

/// Cylinder/heads/sectors-per-track encoding for `total_sectors`.
pub fn chs_geometry(total_sectors: u64) -> u32 {
    let total = total_sectors.min(65535 * 16 * 255);
    let (spt, heads, cyl_x_heads);
    if total >= 65535 * 16 * 63 {
        spt = 255;
        heads = 16;
        cyl_x_heads = total / spt;
    } else {
        let mut s = 17;
        let mut cxh = total / s;
        let mut h = cxh.div_ceil(1024).max(4);
        if cxh >= h * 1024 || h > 16 {
            s = 31;
            h = 16;
            cxh = total / s;
        }
        if cxh >= h * 1024 {
            s = 63;
            h = 16;
            cxh = total / s;
        }
        spt = s;
        heads = h;
        cyl_x_heads = cxh;
    }
    let cylinders = cyl_x_heads / heads;
    ((cylinders as u32) << 16) | ((heads as u32) << 8) | spt as u32
}
