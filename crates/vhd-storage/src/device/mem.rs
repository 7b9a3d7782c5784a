use std::io::SeekFrom;

use super::{resolve_seek, DeviceIo};
use crate::util::to_usize;
use crate::{Result, VhdError};

/// Growable in-memory device.
#[derive(Debug, Default, Clone)]
pub struct MemDevice {
    data: Vec<u8>,
    pos: u64,
    read_only: bool,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl DeviceIo for MemDevice {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = resolve_seek(self.pos, Some(self.data.len() as u64), pos)?;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.pread(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.pwrite(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let start = to_usize(offset, "memory device offset")?;
        let avail = self.data.len().saturating_sub(start).min(buf.len());
        if avail < buf.len() {
            return Err(VhdError::ShortIo {
                op: "read",
                expected: buf.len(),
                actual: avail,
            });
        }
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if self.read_only {
            return Err(VhdError::ReadOnly);
        }
        let start = to_usize(offset, "memory device offset")?;
        let end = start
            .checked_add(buf.len())
            .ok_or(VhdError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }
}
