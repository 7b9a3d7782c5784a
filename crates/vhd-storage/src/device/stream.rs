use std::io::{ErrorKind, Read, SeekFrom, Write};

use super::{resolve_seek, DeviceIo};
use crate::{Result, VhdError};

const SKIP_CHUNK: usize = 4096;

enum Channel {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn Write + Send>),
    Closed,
}

/// Forward-only byte channel.
///
/// Forward seeks are emulated: a reader consumes and discards the skipped bytes, a writer
/// emits zero padding. Moving backward, or seeking relative to the end, fails with
/// [`VhdError::NotSeekable`]. Positional calls are a seek followed by a sequential transfer
/// and obey the same rule.
pub struct StreamDevice {
    channel: Channel,
    pos: u64,
}

impl std::fmt::Debug for StreamDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.channel {
            Channel::Reader(_) => "reader",
            Channel::Writer(_) => "writer",
            Channel::Closed => "closed",
        };
        f.debug_struct("StreamDevice")
            .field("mode", &mode)
            .field("pos", &self.pos)
            .finish()
    }
}

impl StreamDevice {
    pub fn reader(r: impl Read + Send + 'static) -> Self {
        Self {
            channel: Channel::Reader(Box::new(r)),
            pos: 0,
        }
    }

    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self {
            channel: Channel::Writer(Box::new(w)),
            pos: 0,
        }
    }

    pub fn stdin() -> Self {
        Self::reader(std::io::stdin())
    }

    pub fn stdout() -> Self {
        Self::writer(std::io::stdout())
    }

    /// Reads and discards everything left in the channel.
    pub fn drain(&mut self) -> Result<u64> {
        let Channel::Reader(r) = &mut self.channel else {
            return Ok(0);
        };
        let n = std::io::copy(r, &mut std::io::sink())?;
        self.pos += n;
        Ok(n)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<()> {
        let r = match &mut self.channel {
            Channel::Reader(r) => r,
            Channel::Writer(_) => return Err(VhdError::NotSupported("read from a write stream")),
            Channel::Closed => return Err(VhdError::InvalidState("stream is closed".into())),
        };
        let mut done = 0;
        while done < buf.len() {
            match r.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.pos += done as u64;
                    return Err(e.into());
                }
            }
        }
        self.pos += done as u64;
        if done != buf.len() {
            return Err(VhdError::ShortIo {
                op: "read",
                expected: buf.len(),
                actual: done,
            });
        }
        Ok(())
    }

    fn write_some(&mut self, buf: &[u8]) -> Result<()> {
        let w = match &mut self.channel {
            Channel::Writer(w) => w,
            Channel::Reader(_) => return Err(VhdError::ReadOnly),
            Channel::Closed => return Err(VhdError::InvalidState("stream is closed".into())),
        };
        let mut done = 0;
        while done < buf.len() {
            match w.write(&buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.pos += done as u64;
                    return Err(e.into());
                }
            }
        }
        self.pos += done as u64;
        if done != buf.len() {
            return Err(VhdError::ShortIo {
                op: "write",
                expected: buf.len(),
                actual: done,
            });
        }
        Ok(())
    }

    fn advance_to(&mut self, target: u64) -> Result<()> {
        if target < self.pos {
            return Err(VhdError::NotSeekable("backward seek on a stream"));
        }
        let mut chunk = [0u8; SKIP_CHUNK];
        while self.pos < target {
            let n = (target - self.pos).min(SKIP_CHUNK as u64) as usize;
            match self.channel {
                Channel::Reader(_) => self.read_some(&mut chunk[..n])?,
                Channel::Writer(_) => self.write_some(&chunk[..n])?,
                Channel::Closed => return Err(VhdError::InvalidState("stream is closed".into())),
            }
        }
        Ok(())
    }
}

impl DeviceIo for StreamDevice {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if matches!(pos, SeekFrom::End(_)) {
            return Err(VhdError::NotSeekable("seek relative to the end of a stream"));
        }
        let target = resolve_seek(self.pos, None, pos)?;
        self.advance_to(target)?;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_some(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_some(buf)
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.advance_to(offset)?;
        self.read_some(buf)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.advance_to(offset)?;
        self.write_some(buf)
    }

    fn close(&mut self) -> Result<()> {
        if let Channel::Writer(w) = &mut self.channel {
            w.flush()?;
        }
        self.channel = Channel::Closed;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        matches!(self.channel, Channel::Writer(_))
    }
}
