use std::path::Path;

use super::{clone_metadata_sized, discard_output, Progress};
use crate::bitmap::{runs_by, test_bit};
use crate::chain::sort_chain;
use crate::device::{DeviceIo, FileDevice};
use crate::util::sectors_to_bytes;
use crate::vhd::VhdImage;
use crate::{Result, VhdError};

#[derive(Debug, Clone, Copy, Default)]
pub struct CoalesceOptions {
    /// Continue with a warning when the inputs do not form a chain.
    pub ignore_order: bool,
}

/// Collapses a chain of images into a single new image at `output`.
///
/// `images` are sorted leaf first. The output takes its metadata from the oldest image and
/// the size and identity of the newest; sectors from newer images shadow older ones. The
/// output is removed if anything fails after it was created.
pub fn stream_coalesce<D: DeviceIo>(
    images: &mut [VhdImage<D>],
    output: &Path,
    opts: CoalesceOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    if images.is_empty() {
        return Err(VhdError::InvalidArgument("no images to coalesce".into()));
    }
    if let Err(e) = sort_chain(images) {
        if !opts.ignore_order {
            return Err(e);
        }
        tracing::warn!(error = %e, "continuing with mis-ordered images, output may not contain what you expect");
    }

    let newest = &images[0];
    let capacity = newest.capacity();
    let max_capacity = newest
        .header()?
        .max_bat_size as u64
        * newest.block_size()? as u64;
    let uuid = newest.uuid();
    let timestamp = newest.footer().timestamp;

    let oldest = images.len() - 1;
    let mut dst = clone_metadata_sized(
        &mut images[oldest],
        output,
        capacity,
        Some(max_capacity),
        true,
    )?;

    let result = (|| {
        dst.footer_mut().uuid = uuid;
        dst.footer_mut().timestamp = timestamp;
        dst.write_footer()?;

        let total = images.iter().map(|i| i.bat().allocated_count()).sum();
        progress.begin(total);
        for src in images.iter_mut() {
            coalesce_one(src, &mut dst, progress)?;
        }
        progress.finish();
        dst.close()
    })();

    if result.is_err() {
        discard_output(output);
    }
    result
}

fn coalesce_one<D: DeviceIo>(
    src: &mut VhdImage<D>,
    dst: &mut VhdImage<FileDevice>,
    progress: &mut dyn Progress,
) -> Result<()> {
    for (block, _) in src.bat().physical_order() {
        progress.advance(1);
        copy_block(src, dst, block).map_err(|e| {
            tracing::error!(uuid = %src.uuid(), block, error = %e, "coalescing block failed");
            e
        })?;
    }
    Ok(())
}

fn copy_block<D: DeviceIo>(
    src: &mut VhdImage<D>,
    dst: &mut VhdImage<FileDevice>,
    block: u32,
) -> Result<()> {
    let block_size = src.block_size()?;
    if block_size != dst.block_size()? {
        return Err(VhdError::InvalidArgument(format!(
            "{} and the output have different block sizes",
            src.name()
        )));
    }
    let start = block as u64 * block_size as u64;
    if start > dst.capacity() {
        return Err(VhdError::InvalidArgument(format!(
            "block {block} of {} lies beyond the end of the output",
            src.name()
        )));
    }
    if start > src.capacity() || src.bat().get(block)?.is_none() {
        return Ok(());
    }
    if dst.batmap_test(block) {
        return Ok(());
    }

    let spb = src.spb()?;
    let dst_bm = match dst.bat().get(block)? {
        Some(_) => Some(dst.read_bitmap(block)?),
        None => None,
    };
    let src_bm = src.read_bitmap(block)?;
    let first = block as u64 * spb;
    let limit = dst.capacity_sectors().saturating_sub(first).min(spb);

    let wanted = |i: u64| {
        i < limit
            && test_bit(&src_bm, i)
            && !dst_bm.as_ref().is_some_and(|bm| test_bit(bm, i))
    };
    let runs: Vec<_> = runs_by(0, spb, wanted).filter(|r| r.set).collect();

    for run in runs {
        let len = sectors_to_bytes(run.len)? as usize;
        let mut buf = vec![0u8; len];
        src.read_block_raw(block, run.start, &mut buf)?;
        dst.write_sectors(first + run.start, &buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::transform::NoProgress;
    use crate::vhd::{CreateOptions, OpenMode, ParentSpec};
    use crate::SECTOR_SIZE;

    const BS: u32 = 64 * 1024;

    fn image(parent: Option<&VhdImage<MemDevice>>) -> VhdImage<MemDevice> {
        let opts = match parent {
            None => CreateOptions::dynamic(1 << 20),
            Some(p) => CreateOptions::differencing(
                1 << 20,
                ParentSpec::Image {
                    uuid: p.uuid(),
                    timestamp: p.footer().timestamp,
                    path: "parent.vhd".into(),
                },
            ),
        };
        VhdImage::create_on(MemDevice::new(), &opts.with_block_size(BS)).unwrap()
    }

    fn sector(byte: u8) -> Vec<u8> {
        vec![byte; SECTOR_SIZE]
    }

    #[test]
    fn newer_sectors_shadow_older_ones() {
        let mut x = image(None);
        x.write_sectors(0, &sector(b'x')).unwrap();
        x.write_sectors(1, &sector(b'x')).unwrap();
        x.write_sectors(400, &sector(b'x')).unwrap();
        let mut y = image(Some(&x));
        y.write_sectors(1, &sector(b'y')).unwrap();
        let mut z = image(Some(&y));
        z.write_sectors(2, &sector(b'z')).unwrap();
        let z_uuid = z.uuid();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.vhd");
        let mut chain = vec![x, z, y];
        stream_coalesce(&mut chain, &out, CoalesceOptions::default(), &mut NoProgress).unwrap();

        let mut merged = VhdImage::open_path(&out, OpenMode::ReadOnly).unwrap();
        assert_eq!(merged.uuid(), z_uuid);
        assert_eq!(merged.disk_type(), crate::format::DiskType::Dynamic);
        let mut buf = vec![0u8; 3 * SECTOR_SIZE];
        merged.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf[0], b'x');
        assert_eq!(buf[SECTOR_SIZE], b'y');
        assert_eq!(buf[2 * SECTOR_SIZE], b'z');
        let mut far = sector(0);
        merged.read_sectors(400, &mut far).unwrap();
        assert_eq!(far, sector(b'x'));
        merged.read_sectors(3, &mut far).unwrap();
        assert_eq!(far, sector(0));
    }

    #[test]
    fn broken_chain_is_refused_unless_ignored() {
        let x = image(None);
        let stray = image(None);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.vhd");

        let mut chain = vec![x, stray];
        let err = stream_coalesce(&mut chain, &out, CoalesceOptions::default(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, VhdError::BrokenChain(_)));
        assert!(!out.exists());

        let opts = CoalesceOptions { ignore_order: true };
        stream_coalesce(&mut chain, &out, opts, &mut NoProgress).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn existing_output_is_kept() {
        let mut chain = vec![image(None)];
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.vhd");
        std::fs::write(&out, b"keep").unwrap();
        let err = stream_coalesce(&mut chain, &out, CoalesceOptions::default(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, VhdError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&out).unwrap(), b"keep");
    }
}
