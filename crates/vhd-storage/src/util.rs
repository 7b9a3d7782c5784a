use crate::{Result, VhdError, SECTOR_SIZE};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(VhdError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(VhdError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    if end > capacity {
        return Err(VhdError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

pub fn sectors_to_bytes(sectors: u64) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)
}

/// Rounds a byte count up to whole sectors.
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE as u64)
}

pub fn sector_aligned_len(len: usize) -> Result<()> {
    if !len.is_multiple_of(SECTOR_SIZE) {
        return Err(VhdError::UnalignedLength {
            len,
            alignment: SECTOR_SIZE,
        });
    }
    Ok(())
}

pub fn to_usize(value: u64, ctx: &'static str) -> Result<usize> {
    value.try_into().map_err(|_| VhdError::Unsupported(ctx))
}

pub(crate) fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

pub(crate) fn put_be_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

pub(crate) fn put_be_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

/// One's complement of the byte sum of `raw`, skipping the 4-byte checksum field at
/// `skip`.
pub(crate) fn vhd_checksum(raw: &[u8], skip: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (skip..skip + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}
