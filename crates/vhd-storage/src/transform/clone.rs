use std::path::Path;

use crate::device::{DeviceIo, FileDevice};
use crate::format::{chs_geometry, DiskType, Footer};
use crate::vhd::{LocatorData, VhdImage};
use crate::{Result, VhdError, SECTOR_SIZE};

/// How [`clone_metadata_with`] shapes the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Virtual size of the output; defaults to the source capacity.
    pub capacity: Option<u64>,
    /// Size the BAT is provisioned for; never below `capacity`.
    pub max_capacity: Option<u64>,
    /// Reuse the footer the source was loaded with instead of re-reading the primary one.
    pub quick: bool,
    /// Carry the source keyhash into the output batmap.
    pub keep_keyhash: bool,
}

/// Creates an empty image at `output` with the metadata of `src`: same type, UUID,
/// timestamps, block size, parent linkage and locator payloads, an empty BAT, and a batmap
/// only if `src` has one. The keyhash is not carried over.
///
/// With `quick` the footer `src` was loaded with is reused; otherwise the primary footer is
/// re-read, which needs a seekable source.
pub fn clone_metadata<D: DeviceIo>(
    src: &mut VhdImage<D>,
    output: &Path,
    quick: bool,
) -> Result<VhdImage<FileDevice>> {
    clone_metadata_with(src, output, &CloneOptions { quick, ..Default::default() })
}

/// [`clone_metadata`] with an explicit virtual size and BAT provisioning.
pub fn clone_metadata_sized<D: DeviceIo>(
    src: &mut VhdImage<D>,
    output: &Path,
    capacity: u64,
    max_capacity: Option<u64>,
    quick: bool,
) -> Result<VhdImage<FileDevice>> {
    let opts = CloneOptions {
        capacity: Some(capacity),
        max_capacity,
        quick,
        keep_keyhash: false,
    };
    clone_metadata_with(src, output, &opts)
}

pub fn clone_metadata_with<D: DeviceIo>(
    src: &mut VhdImage<D>,
    output: &Path,
    opts: &CloneOptions,
) -> Result<VhdImage<FileDevice>> {
    let dev = FileDevice::create_new(output)?;
    match clone_onto(src, dev, opts) {
        Ok(mut img) => {
            img.set_path(output);
            Ok(img)
        }
        Err(e) => {
            super::discard_output(output);
            Err(e)
        }
    }
}

fn clone_onto<D: DeviceIo, O: DeviceIo>(
    src: &mut VhdImage<D>,
    dev: O,
    opts: &CloneOptions,
) -> Result<VhdImage<O>> {
    let capacity = opts.capacity.unwrap_or(src.capacity());
    if !matches!(src.disk_type(), DiskType::Dynamic | DiskType::Differencing) {
        return Err(VhdError::InvalidArgument(format!(
            "{} is not a dynamic or differencing image",
            src.name()
        )));
    }
    if !capacity.is_multiple_of(SECTOR_SIZE as u64) || capacity == 0 {
        return Err(VhdError::InvalidArgument(format!(
            "capacity {capacity} is not a non-zero sector multiple"
        )));
    }

    // Locators sit past the BAT, so read them before touching the primary footer at the
    // end of a forward-only source.
    let used = src.header()?.locators;
    let mut locators = Vec::new();
    for loc in used.iter().filter(|l| l.is_used()) {
        let data = src.read_locator(loc)?;
        locators.push(LocatorData {
            code: loc.code,
            data_len: loc.data_len,
            data,
        });
    }

    let mut footer = if opts.quick {
        src.footer().clone()
    } else {
        src.read_primary_footer()?
    };
    resize_footer(&mut footer, capacity);

    let mut header = src.header()?.clone();
    let block_size = header.block_size as u64;
    let wanted = opts.max_capacity.unwrap_or(capacity).max(capacity);
    let entries: u32 = wanted
        .div_ceil(block_size)
        .try_into()
        .map_err(|_| VhdError::Unsupported("bat too large"))?;
    header.max_bat_size = header.max_bat_size.max(entries);

    let with_batmap = src.has_batmap();
    let keyhash = src.keyhash();
    let mut out = VhdImage::format(dev, footer, header, with_batmap, locators)?;
    if opts.keep_keyhash && with_batmap && keyhash.is_present() {
        out.set_keyhash(&keyhash)?;
    }
    tracing::debug!(uuid = %out.uuid(), capacity, quick = opts.quick, "cloned metadata");
    Ok(out)
}

fn resize_footer(footer: &mut Footer, capacity: u64) {
    if footer.current_size != capacity {
        footer.current_size = capacity;
        footer.geometry = chs_geometry(capacity / SECTOR_SIZE as u64);
    }
}

/// Wraps `dev` as an output image carrying an in-memory copy of `src`'s metadata. Nothing
/// is written until the caller writes through the returned handle.
pub fn stream_initialize<D: DeviceIo, S>(dev: D, src: &VhdImage<S>) -> Result<VhdImage<D>> {
    if !src.footer.disk_type.is_sparse() {
        return Err(VhdError::InvalidArgument(
            "stream output needs a dynamic or differencing source".into(),
        ));
    }
    Ok(VhdImage::from_parts(
        dev,
        src.footer.clone(),
        src.header.clone(),
        src.bat.clone(),
        src.batmap.clone(),
    ))
}
