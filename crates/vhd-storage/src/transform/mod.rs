//! Whole-image transforms that stream one or more images into a new artifact.
//!
//! Sources may sit on forward-only devices: each transform visits source blocks in
//! physical order, so every source read lands at or after the previous one.

mod clone;
mod coalesce;
mod decrypt;
mod encrypt;

pub use clone::{
    clone_metadata, clone_metadata_sized, clone_metadata_with, stream_initialize, CloneOptions,
};
pub use coalesce::{stream_coalesce, CoalesceOptions};
pub use decrypt::dm_decrypt;
pub use encrypt::{dm_encrypt, instantiate_output, EncryptJob};

/// Progress sink for long-running transforms. Counts are in blocks.
pub trait Progress {
    fn begin(&mut self, total: u64);
    fn advance(&mut self, n: u64);
    fn finish(&mut self);
}

/// Discards progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn begin(&mut self, _total: u64) {}
    fn advance(&mut self, _n: u64) {}
    fn finish(&mut self) {}
}

/// Removes a partially written output, logging instead of failing.
pub(crate) fn discard_output(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}
