//! On-disk VHD structures. All multi-byte integers are big-endian.

mod bat;
mod batmap;
mod footer;
mod header;

pub use bat::{Bat, BAT_UNUSED};
pub use batmap::{Batmap, BatmapHeader, BATMAP_VERSION};
pub use footer::{chs_geometry, vhd_time, DiskType, Footer, FOOTER_SIZE};
pub use header::{Header, LocatorCode, ParentLocator, HEADER_SIZE, PARENT_LOCATOR_COUNT};

/// Default dynamic block size (2 MiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

pub const VHD_VERSION_1_0: u32 = 0x0001_0000;

/// Creator application tag written by this crate; batmaps are only honoured on images
/// carrying it.
pub const CREATOR_APP: [u8; 4] = *b"tap\0";

/// Version of the creator format: 1.3 (batmap present, keyhash capable).
pub const CREATOR_VERSION: u32 = 0x0001_0003;

pub(crate) const CREATOR_VERSION_BATMAP_PROBE: u32 = 0x0001_0001;
pub(crate) const CREATOR_VERSION_BATMAP: u32 = 0x0001_0002;
