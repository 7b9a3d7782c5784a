use super::{stream_initialize, Progress};
use crate::bitmap::runs;
use crate::crypto::SectorCipher;
use crate::device::DeviceIo;
use crate::util::{bytes_to_sectors, sectors_to_bytes, to_usize};
use crate::vhd::VhdImage;
use crate::{Result, VhdError, PAGE_SIZE, SECTOR_SIZE};

/// Rebuilds a sparse image from its metadata (`src`) and the plaintext view of its data
/// (`raw_in`, addressed by logical offset).
///
/// Output blocks are laid out in BAT order with page-aligned data regions, so the output
/// is written strictly front to back and `dst` may be a forward-only stream. With a
/// `cipher`, `raw_in` holds ciphertext and is decrypted on the way through.
pub fn dm_decrypt<R: DeviceIo, S: DeviceIo, O: DeviceIo>(
    raw_in: &mut R,
    src: &mut VhdImage<S>,
    dst: O,
    cipher: Option<&SectorCipher>,
    progress: &mut dyn Progress,
) -> Result<VhdImage<O>> {
    let mut dst = stream_initialize(dst, src)?;
    let spp = (PAGE_SIZE / SECTOR_SIZE) as u64;
    let bm_secs = dst.bm_secs()?;

    dst.bat.reset();
    for (block, _) in src.bat().allocated() {
        let mut sector = bytes_to_sectors(dst.end_of_data()?);
        if (sector + bm_secs) % spp != 0 {
            sector += spp - (sector + bm_secs) % spp;
        }
        let entry = u32::try_from(sector)
            .map_err(|_| VhdError::Unsupported("image exceeds 32-bit sector addressing"))?;
        dst.bat.set(block, entry)?;
    }

    let eoh = src.end_of_headers()?;
    let mut meta = vec![0u8; to_usize(eoh, "metadata too large")?];
    src.dev.pread(&mut meta, 0)?;
    let table = to_usize(src.header()?.table_offset, "metadata too large")?;
    let bat = dst.bat.to_bytes()?;
    meta.get_mut(table..table + bat.len())
        .ok_or(VhdError::Corrupt("bat beyond end of headers"))?
        .copy_from_slice(&bat);
    dst.dev.pwrite(&meta, 0)?;

    progress.begin(src.bat().allocated_count());
    for block in 0..src.bat().len() {
        copy_block(raw_in, src, &mut dst, block, cipher)?;
        if src.bat().get(block)?.is_some() {
            progress.advance(1);
        }
    }

    let eod = dst.end_of_data()?;
    dst.write_footer_at(eod)?;
    progress.finish();
    Ok(dst)
}

fn copy_block<R: DeviceIo, S: DeviceIo, O: DeviceIo>(
    raw_in: &mut R,
    src: &mut VhdImage<S>,
    dst: &mut VhdImage<O>,
    block: u32,
    cipher: Option<&SectorCipher>,
) -> Result<()> {
    if src.bat().get(block)?.is_none() {
        if dst.bat().get(block)?.is_some() {
            return Err(VhdError::InvalidState(format!(
                "block {block} allocated in output but not in source"
            )));
        }
        return Ok(());
    }

    let spb = src.spb()?;
    let first = block as u64 * spb;
    let mut data = vec![0u8; to_usize(src.block_size()? as u64, "block too large")?];
    let bm = src.read_bitmap(block)?;
    for run in runs(&bm, 0, spb).filter(|r| r.set) {
        let lo = run.start as usize * SECTOR_SIZE;
        let chunk = &mut data[lo..lo + run.len as usize * SECTOR_SIZE];
        raw_in.pread(chunk, sectors_to_bytes(first + run.start)?)?;
        if let Some(c) = cipher {
            c.decrypt(first + run.start, chunk)?;
        }
    }

    dst.write_bitmap(block, &bm)?;
    dst.write_block(block, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemDevice, StreamDevice};
    use crate::transform::NoProgress;
    use crate::vhd::CreateOptions;
    use std::sync::{Arc, Mutex};

    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rebuilt_image_is_page_aligned_and_streamable() {
        let mut src = VhdImage::create_on(
            MemDevice::new(),
            &CreateOptions::dynamic(1 << 20).with_block_size(64 * 1024),
        )
        .unwrap();
        // Allocate out of BAT order so the output must be re-laid out.
        src.write_sectors(5 * 128 + 3, &[0u8; 512]).unwrap();
        src.write_sectors(128, &[0u8; 1024]).unwrap();

        let mut raw = MemDevice::from_vec(vec![0u8; 1 << 20]);
        raw.pwrite(&[0xabu8; 512], (5 * 128 + 3) * 512).unwrap();
        raw.pwrite(&[0xcdu8; 1024], 128 * 512).unwrap();

        let sink = Arc::new(Mutex::new(Vec::new()));
        let out = StreamDevice::writer(Shared(sink.clone()));
        let dst = dm_decrypt(&mut raw, &mut src, out, None, &mut NoProgress).unwrap();
        dst.close().unwrap();

        let bytes = sink.lock().unwrap().clone();
        let mut img = VhdImage::open(MemDevice::from_vec(bytes)).unwrap();
        assert_eq!(img.uuid(), src.uuid());
        let b1 = img.bat().get(1).unwrap().unwrap() as u64;
        let b5 = img.bat().get(5).unwrap().unwrap() as u64;
        assert!(b1 < b5);
        assert_eq!((b1 + img.bm_secs().unwrap()) % 8, 0);
        assert_eq!((b5 + img.bm_secs().unwrap()) % 8, 0);

        let mut buf = vec![0u8; 512];
        img.read_sectors(5 * 128 + 3, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xab));
        img.read_sectors(5 * 128 + 4, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        img.read_sectors(129, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xcd));
    }
}
