use std::io::SeekFrom;
use std::str::FromStr;

use super::{resolve_seek, DeviceIo};
use crate::{Result, VhdError};

/// Port used when an endpoint string does not carry one.
pub const DEFAULT_REMOTE_PORT: u16 = 4878;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub kind: RemoteFileKind,
    pub size: u64,
}

/// Client side of a remote file service.
///
/// Transfers return the number of bytes moved; anything short of the request is surfaced
/// by [`RemoteDevice`] as [`VhdError::ShortIo`].
pub trait RemoteFileService {
    fn open(&mut self, path: &str, writable: bool) -> std::io::Result<u64>;
    fn pread(&mut self, handle: u64, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;
    fn pwrite(&mut self, handle: u64, buf: &[u8], offset: u64) -> std::io::Result<usize>;
    fn stat(&mut self, path: &str) -> std::io::Result<RemoteStat>;
    fn close(&mut self, handle: u64) -> std::io::Result<()>;
}

/// File on a remote file service.
#[derive(Debug)]
pub struct RemoteDevice<C> {
    service: C,
    path: String,
    handle: Option<u64>,
    pos: u64,
    writable: bool,
}

impl<C: RemoteFileService> RemoteDevice<C> {
    pub fn open(mut service: C, path: impl Into<String>, writable: bool) -> Result<Self> {
        let path = path.into();
        let handle = service.open(&path, writable)?;
        Ok(Self {
            service,
            path,
            handle: Some(handle),
            pos: 0,
            writable,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn into_service(mut self) -> C {
        if let Some(h) = self.handle.take() {
            if let Err(e) = self.service.close(h) {
                tracing::warn!(path = %self.path, error = %e, "failed to close remote file");
            }
        }
        self.service
    }

    fn handle(&self) -> Result<u64> {
        self.handle
            .ok_or_else(|| VhdError::InvalidState("remote device is closed".into()))
    }

    fn stat_size(&mut self) -> Result<u64> {
        let st = self.service.stat(&self.path)?;
        if st.kind != RemoteFileKind::File {
            return Err(VhdError::NotSeekable("remote object is not a regular file"));
        }
        Ok(st.size)
    }
}

impl<C: RemoteFileService> DeviceIo for RemoteDevice<C> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = match pos {
            SeekFrom::End(_) => Some(self.stat_size()?),
            _ => None,
        };
        self.pos = resolve_seek(self.pos, size, pos)?;
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
        let handle = self.handle()?;
        let n = self.service.pread(handle, buf, offset)?;
        if n != buf.len() {
            return Err(VhdError::ShortIo {
                op: "remote read",
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.writable {
            return Err(VhdError::ReadOnly);
        }
        let handle = self.handle()?;
        let n = self.service.pwrite(handle, buf, offset)?;
        if n != buf.len() {
            return Err(VhdError::ShortIo {
                op: "remote write",
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(h) = self.handle.take() {
            self.service.close(h)?;
        }
        Ok(())
    }

    fn size(&mut self) -> Result<Option<u64>> {
        self.stat_size().map(Some)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Canonical absolute form of `name` on the remote service.
///
/// `.` and `..` are folded lexically, and every component must exist; every component but
/// the last must be a directory.
pub fn remote_realpath<C: RemoteFileService>(service: &mut C, name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(VhdError::InvalidArgument("empty remote path".into()));
    }
    let components: Vec<&str> = name.split('/').filter(|c| !c.is_empty()).collect();
    let mut resolved: Vec<&str> = Vec::new();
    for (i, comp) in components.iter().enumerate() {
        match *comp {
            "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            c => resolved.push(c),
        }
        let path = format!("/{}", resolved.join("/"));
        let st = service.stat(&path)?;
        let last = i + 1 == components.len();
        if !last && st.kind != RemoteFileKind::Directory {
            return Err(VhdError::InvalidArgument(format!("{path} is not a directory")));
        }
    }
    Ok(format!("/{}", resolved.join("/")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTransport {
    /// Inter-domain channel addressed by domain id.
    LocalChannel { domain: u32 },
    Tcp { host: String },
}

/// Remote service address in `scheme:host[:port]` form, `scheme` being `v4v` or `tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub transport: RemoteTransport,
    pub port: u16,
}

impl FromStr for RemoteEndpoint {
    type Err = VhdError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VhdError::InvalidArgument(format!("invalid remote endpoint {s:?}"));

        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_REMOTE_PORT),
        };
        let transport = match scheme {
            "v4v" => RemoteTransport::LocalChannel {
                domain: host.parse().map_err(|_| invalid())?,
            },
            "tcp" if !host.is_empty() => RemoteTransport::Tcp {
                host: host.to_string(),
            },
            _ => return Err(invalid()),
        };
        Ok(Self { transport, port })
    }
}
