//! Byte-level device access underneath a VHD image.
//!
//! Every image handle owns exactly one [`DeviceIo`] implementation:
//!
//! - [`FileDevice`]: positional I/O on a local file
//! - [`StreamDevice`]: forward-only byte channel (pipes, stdin/stdout)
//! - [`RemoteDevice`]: file served by a remote file service
//! - [`MemDevice`]: in-memory buffer
//!
//! A transfer that moves fewer bytes than requested is reported as
//! [`VhdError::ShortIo`](crate::VhdError::ShortIo), never as success.

mod file;
mod mem;
mod remote;
mod stream;

use std::io::SeekFrom;

use crate::Result;

pub use file::FileDevice;
pub use mem::MemDevice;
pub use remote::{
    remote_realpath, RemoteDevice, RemoteEndpoint, RemoteFileKind, RemoteFileService,
    RemoteStat, RemoteTransport, DEFAULT_REMOTE_PORT,
};
pub use stream::StreamDevice;

pub trait DeviceIo {
    /// Current sequential position.
    fn position(&self) -> u64;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Reads exactly `buf.len()` bytes at the current position and advances it.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` at the current position and advances it.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes all of `buf` at `offset`.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Size of the underlying object, when the device can report one.
    fn size(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn is_writable(&self) -> bool;
}

impl<T: DeviceIo + ?Sized> DeviceIo for Box<T> {
    fn position(&self) -> u64 {
        (**self).position()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        (**self).pread(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        (**self).pwrite(buf, offset)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn size(&mut self) -> Result<Option<u64>> {
        (**self).size()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }
}

/// Resolves a `SeekFrom` against the current position and (optionally) the object size.
pub(crate) fn resolve_seek(current: u64, size: Option<u64>, pos: SeekFrom) -> Result<u64> {
    use crate::VhdError;

    let (base, delta) = match pos {
        SeekFrom::Start(off) => return Ok(off),
        SeekFrom::Current(delta) => (current, delta),
        SeekFrom::End(delta) => (
            size.ok_or(VhdError::NotSeekable("size of device is unknown"))?,
            delta,
        ),
    };
    base.checked_add_signed(delta)
        .ok_or_else(|| VhdError::InvalidArgument(format!("seek to negative offset ({delta})")))
}
