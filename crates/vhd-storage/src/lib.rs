//! Sparse copy-on-write VHD images: reading, writing, chaining and bulk transforms.
//!
//! The crate is layered bottom-up:
//!
//! - [`device`]: byte devices an image lives on (files, forward-only streams, a remote file
//!   service, memory)
//! - [`format`]: the on-disk footer, sparse header, BAT and batmap
//! - [`VhdImage`]: an open image with sector I/O and allocate-on-write
//! - [`chain`]: parent resolution, chain ordering and key discovery along a chain
//! - [`transform`]: metadata cloning, chain coalescing, dm-crypt import and export
//! - [`crypto`]: keyfiles, keyhashes and the AES-XTS sector cipher
//!
//! All I/O is synchronous. A handle is owned by one thread at a time and nothing is
//! cached across handles.

pub mod bitmap;
pub mod chain;
mod config;
pub mod crypto;
pub mod device;
mod error;
pub mod format;
#[cfg(test)]
mod proptests;
pub mod transform;
mod util;
mod vhd;

pub use config::{EngineConfig, KEY_SERVER_ENV, VHD_SERVER_ENV};
pub use error::{ErrorClass, Result, VhdError};
pub use vhd::{CreateOptions, OpenMode, ParentSpec, VhdImage};

pub const SECTOR_SIZE: usize = 512;

/// Alignment of block data regions laid out for direct I/O.
pub const PAGE_SIZE: usize = 4096;
