use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use super::{resolve_seek, DeviceIo};
use crate::{Result, VhdError};

/// Local file accessed with positional reads and writes.
///
/// Positional calls never disturb the sequential cursor.
#[derive(Debug)]
pub struct FileDevice {
    file: Option<File>,
    path: PathBuf,
    pos: u64,
    writable: bool,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(Self::from_file(file, path, writable))
    }

    /// Creates a new file, failing if `path` already exists.
    pub fn create_new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VhdError::AlreadyExists(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_file(file, path, true))
    }

    pub fn from_file(file: File, path: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            file: Some(file),
            path: path.into(),
            pos: 0,
            writable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| VhdError::InvalidState("file device is closed".into()))
    }

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        let file = self.file()?;
        let expected = buf.len();
        while !buf.is_empty() {
            match read_at(file, buf, offset) {
                Ok(0) => {
                    return Err(VhdError::ShortIo {
                        op: "read",
                        expected,
                        actual: expected - buf.len(),
                    })
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset = offset.checked_add(n as u64).ok_or(VhdError::OffsetOverflow)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        if !self.writable {
            return Err(VhdError::ReadOnly);
        }
        let file = self.file()?;
        let expected = buf.len();
        while !buf.is_empty() {
            match write_at(file, buf, offset) {
                Ok(0) => {
                    return Err(VhdError::ShortIo {
                        op: "write",
                        expected,
                        actual: expected - buf.len(),
                    })
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset = offset.checked_add(n as u64).ok_or(VhdError::OffsetOverflow)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl DeviceIo for FileDevice {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = match pos {
            SeekFrom::End(_) => Some(self.file()?.metadata()?.len()),
            _ => None,
        };
        self.pos = resolve_seek(self.pos, size, pos)?;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact_at(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all_at(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.read_exact_at(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.write_all_at(buf, offset)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.writable {
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn size(&mut self) -> Result<Option<u64>> {
        Ok(Some(self.file()?.metadata()?.len()))
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}
