use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VhdError>;

#[cfg(target_os = "linux")]
pub(crate) const ENOKEY: i32 = libc::ENOKEY;
#[cfg(not(target_os = "linux"))]
pub(crate) const ENOKEY: i32 = 126;

/// Coarse classification of a [`VhdError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or inconsistent on-disk metadata.
    Format,
    /// Broken parent linkage or an image set that does not form one chain.
    Chain,
    /// Missing, unexpected or mismatching key material.
    Key,
    /// Failures of the underlying device, including short transfers.
    Io,
    /// Operation not permitted in the current state of the handle.
    State,
}

/// Unified error type for VHD storage operations.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("not a vhd: {0}")]
    NotVhd(&'static str),

    #[error("{what} checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error("corrupt vhd: {0}")]
    Corrupt(&'static str),

    #[error("unsupported vhd feature: {0}")]
    Unsupported(&'static str),

    #[error("broken vhd chain: {0}")]
    BrokenChain(String),

    #[error("no key available for {0}")]
    NoKey(String),

    #[error("keyfile found for {0} but the image carries no keyhash")]
    UnexpectedKey(String),

    #[error("key does not match the image keyhash")]
    BadKey,

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("cipher failure at sector {sector}: {reason}")]
    Cipher { sector: u64, reason: &'static str },

    #[error("short {op}: expected {expected} bytes, transferred {actual}")]
    ShortIo {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device is read-only")]
    ReadOnly,

    #[error("device is not seekable: {0}")]
    NotSeekable(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}

impl VhdError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VhdError::NotVhd(_)
            | VhdError::ChecksumMismatch { .. }
            | VhdError::Corrupt(_)
            | VhdError::Unsupported(_) => ErrorClass::Format,
            VhdError::BrokenChain(_) => ErrorClass::Chain,
            VhdError::NoKey(_)
            | VhdError::UnexpectedKey(_)
            | VhdError::BadKey
            | VhdError::InvalidKey(_)
            | VhdError::Cipher { .. } => ErrorClass::Key,
            VhdError::ShortIo { .. } | VhdError::Io(_) => ErrorClass::Io,
            VhdError::UnalignedLength { .. }
            | VhdError::OutOfBounds { .. }
            | VhdError::OffsetOverflow
            | VhdError::ReadOnly
            | VhdError::NotSeekable(_)
            | VhdError::InvalidArgument(_)
            | VhdError::InvalidState(_)
            | VhdError::AlreadyExists(_)
            | VhdError::NotSupported(_) => ErrorClass::State,
        }
    }

    /// Positive POSIX errno describing this error, as reported by the command-line tools.
    pub fn errno(&self) -> i32 {
        match self {
            VhdError::NotVhd(_)
            | VhdError::Corrupt(_)
            | VhdError::UnalignedLength { .. }
            | VhdError::OutOfBounds { .. }
            | VhdError::InvalidArgument(_)
            | VhdError::InvalidKey(_) => libc::EINVAL,
            VhdError::ChecksumMismatch { .. } => libc::EINVAL,
            VhdError::Unsupported(_) | VhdError::NotSupported(_) => libc::ENOSYS,
            VhdError::BrokenChain(_) => libc::EINVAL,
            VhdError::NoKey(_) | VhdError::BadKey => ENOKEY,
            VhdError::UnexpectedKey(_) => libc::EACCES,
            VhdError::Cipher { .. } => libc::EIO,
            VhdError::ShortIo { .. } => libc::EIO,
            VhdError::OffsetOverflow => libc::EOVERFLOW,
            VhdError::Io(e) => e.raw_os_error().unwrap_or(match e.kind() {
                std::io::ErrorKind::NotFound => libc::ENOENT,
                std::io::ErrorKind::PermissionDenied => libc::EACCES,
                std::io::ErrorKind::AlreadyExists => libc::EEXIST,
                _ => libc::EIO,
            }),
            VhdError::ReadOnly => libc::EPERM,
            VhdError::NotSeekable(_) => libc::ESPIPE,
            VhdError::InvalidState(_) => libc::EIO,
            VhdError::AlreadyExists(_) => libc::EEXIST,
        }
    }
}
