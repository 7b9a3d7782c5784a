use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

use crate::bitmap::{self, Run};
use crate::crypto::{Key, KeyHash, SectorCipher};
use crate::device::{DeviceIo, FileDevice};
use crate::format::{
    Bat, Batmap, BatmapHeader, DiskType, Footer, Header, LocatorCode, ParentLocator,
    CREATOR_VERSION_BATMAP, CREATOR_VERSION_BATMAP_PROBE, DEFAULT_BLOCK_SIZE, FOOTER_SIZE,
    HEADER_SIZE, PARENT_LOCATOR_COUNT,
};
use crate::util::{
    align_up_u64, bytes_to_sectors, checked_range, sector_aligned_len, sectors_to_bytes, to_usize,
};
use crate::{Result, VhdError, PAGE_SIZE, SECTOR_SIZE};

// Hard caps to avoid absurd allocations from untrusted images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024;
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024;

const MAX_METADATA_TAIL_BYTES: u64 = 4 * 1024 * 1024;

const BITMAP_CACHE_BUDGET_BYTES: u64 = 16 * 1024 * 1024;

const BAT_OFFSET: u64 = (SECTOR_SIZE + HEADER_SIZE) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Parent of a differencing image being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentSpec {
    /// Raw (non-VHD) parent: the parent UUID stays nil and no locator is written.
    Raw,
    Image {
        uuid: Uuid,
        timestamp: u32,
        /// Path recorded in the parent locator, relative paths being resolved against the
        /// child's directory.
        path: String,
    },
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub disk_type: DiskType,
    /// Virtual size in bytes; rounded up to whole sectors.
    pub capacity: u64,
    /// Size the BAT is provisioned for; defaults to `capacity`.
    pub max_capacity: Option<u64>,
    pub block_size: u32,
    pub batmap: bool,
    pub parent: Option<ParentSpec>,
}

impl CreateOptions {
    pub fn dynamic(capacity: u64) -> Self {
        Self {
            disk_type: DiskType::Dynamic,
            capacity,
            max_capacity: None,
            block_size: DEFAULT_BLOCK_SIZE,
            batmap: true,
            parent: None,
        }
    }

    pub fn fixed(capacity: u64) -> Self {
        Self {
            disk_type: DiskType::Fixed,
            batmap: false,
            ..Self::dynamic(capacity)
        }
    }

    pub fn differencing(capacity: u64, parent: ParentSpec) -> Self {
        Self {
            disk_type: DiskType::Differencing,
            parent: Some(parent),
            ..Self::dynamic(capacity)
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn without_batmap(mut self) -> Self {
        self.batmap = false;
        self
    }
}

/// Locator payload carried into a newly formatted image.
#[derive(Debug, Clone)]
pub(crate) struct LocatorData {
    pub code: LocatorCode,
    pub data_len: u32,
    pub data: Vec<u8>,
}

/// An open VHD image.
///
/// Every method is synchronous; a handle must not be shared between threads without
/// external locking.
pub struct VhdImage<D> {
    pub(crate) dev: D,
    pub(crate) path: Option<PathBuf>,
    pub(crate) footer: Footer,
    pub(crate) header: Option<Header>,
    pub(crate) bat: Bat,
    pub(crate) batmap: Option<Batmap>,
    bitmap_cache: LruCache<u32, Arc<Vec<u8>>>,
    pub(crate) cipher: Option<SectorCipher>,
    page_aligned: bool,
    // Locator payloads captured at open, keyed by data offset.
    locator_data: Vec<(u64, Vec<u8>)>,
}

impl<D> std::fmt::Debug for VhdImage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdImage")
            .field("path", &self.path)
            .field("uuid", &self.footer.uuid)
            .field("disk_type", &self.footer.disk_type)
            .field("capacity", &self.footer.current_size)
            .finish_non_exhaustive()
    }
}

impl VhdImage<FileDevice> {
    pub fn open_path(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let dev = FileDevice::open(path, mode == OpenMode::ReadWrite)?;
        let mut img = Self::open(dev)?;
        img.path = Some(path.to_path_buf());
        Ok(img)
    }

    /// Creates a new image file; fails if `path` exists and removes the partial file on
    /// error.
    pub fn create(path: impl AsRef<Path>, opts: &CreateOptions) -> Result<Self> {
        let path = path.as_ref();
        let dev = FileDevice::create_new(path)?;
        match Self::create_on(dev, opts) {
            Ok(mut img) => {
                img.path = Some(path.to_path_buf());
                Ok(img)
            }
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Creates a differencing image on top of the image at `parent_path`.
    pub fn snapshot(path: impl AsRef<Path>, parent_path: impl AsRef<Path>) -> Result<Self> {
        let parent_path = parent_path.as_ref();
        let parent = Self::open_path(parent_path, OpenMode::ReadOnly)?;
        let mut opts = CreateOptions::differencing(
            parent.capacity(),
            ParentSpec::Image {
                uuid: parent.uuid(),
                timestamp: parent.footer.timestamp,
                path: parent_path.to_string_lossy().into_owned(),
            },
        );
        if let Some(h) = &parent.header {
            opts.block_size = h.block_size;
        }
        Self::create(path, &opts)
    }
}

impl<D: DeviceIo> VhdImage<D> {
    /// Loads the metadata of the image on `dev`.
    ///
    /// Reads happen at increasing offsets only, so forward-only streams can be opened; on
    /// a stream the footer copy at offset 0 is used.
    pub fn open(mut dev: D) -> Result<Self> {
        let size = dev.size()?;
        let footer = read_footer(&mut dev, size)?;

        if !footer.disk_type.is_sparse() {
            let required = footer
                .current_size
                .checked_add(FOOTER_SIZE as u64)
                .ok_or(VhdError::OffsetOverflow)?;
            if size.is_some_and(|len| len < required) {
                return Err(VhdError::Corrupt("fixed image truncated"));
            }
            return Ok(Self::from_parts(dev, footer, None, Bat::new_unused(0), None));
        }

        if footer.data_offset == u64::MAX
            || footer.data_offset < SECTOR_SIZE as u64
            || !footer.data_offset.is_multiple_of(SECTOR_SIZE as u64)
        {
            return Err(VhdError::Corrupt("header offset invalid"));
        }
        let mut raw = [0u8; HEADER_SIZE];
        dev.pread(&mut raw, footer.data_offset)?;
        let header = Header::parse(&raw)?;

        let required_entries = footer.current_size.div_ceil(header.block_size as u64);
        if (header.max_bat_size as u64) < required_entries {
            return Err(VhdError::Corrupt("bat too small for capacity"));
        }
        let header_end = footer.data_offset + HEADER_SIZE as u64;
        if header.table_offset < header_end && footer.data_offset < header.table_offset {
            return Err(VhdError::Corrupt("bat overlaps header"));
        }
        let bat_bytes = Bat::disk_size(header.max_bat_size)?;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(VhdError::Unsupported("bat too large"));
        }
        let mut raw_bat = vec![0u8; to_usize(bat_bytes, "bat too large")?];
        dev.pread(&mut raw_bat, header.table_offset)?;
        let bat = Bat::parse(&raw_bat, header.max_bat_size)?;

        let tail = read_metadata_tail(&mut dev, size, &footer, &header, &bat)?;

        let mut img = Self::from_parts(dev, footer, Some(header), bat, tail.batmap);
        img.locator_data = tail.locators;
        Ok(img)
    }

    pub(crate) fn from_parts(
        dev: D,
        footer: Footer,
        header: Option<Header>,
        bat: Bat,
        batmap: Option<Batmap>,
    ) -> Self {
        let cap = header
            .as_ref()
            .map(|h| {
                let bitmap = bitmap_bytes(h.block_size).max(SECTOR_SIZE as u64);
                (BITMAP_CACHE_BUDGET_BYTES / bitmap).max(1) as usize
            })
            .and_then(NonZeroUsize::new)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            dev,
            path: None,
            footer,
            header,
            bat,
            batmap,
            bitmap_cache: LruCache::new(cap),
            cipher: None,
            page_aligned: false,
            locator_data: Vec::new(),
        }
    }

    /// Formats a new image on an empty device.
    pub fn create_on(dev: D, opts: &CreateOptions) -> Result<Self> {
        let capacity = align_up_u64(opts.capacity, SECTOR_SIZE as u64)?;
        if capacity == 0 {
            return Err(VhdError::InvalidArgument("capacity must be non-zero".into()));
        }
        let mut footer = Footer::new(opts.disk_type, capacity);

        if opts.disk_type == DiskType::Fixed {
            let mut img = Self::from_parts(dev, footer, None, Bat::new_unused(0), None);
            img.write_footer()?;
            return Ok(img);
        }

        let block_size = opts.block_size;
        if !block_size.is_power_of_two() || (block_size as usize) < SECTOR_SIZE {
            return Err(VhdError::InvalidArgument(format!(
                "block size {block_size} is not a power of two of at least one sector"
            )));
        }
        let max_capacity = opts.max_capacity.unwrap_or(capacity).max(capacity);
        let max_bat: u32 = max_capacity
            .div_ceil(block_size as u64)
            .try_into()
            .map_err(|_| VhdError::Unsupported("bat too large"))?;

        let mut header = Header::new(BAT_OFFSET, max_bat, block_size);
        let mut locators = Vec::new();
        match (&opts.disk_type, &opts.parent) {
            (DiskType::Differencing, Some(ParentSpec::Raw)) => {}
            (DiskType::Differencing, Some(ParentSpec::Image { uuid, timestamp, path })) => {
                header.parent_uuid = *uuid;
                header.parent_timestamp = *timestamp;
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                header.set_parent_name(&name)?;
                let url = format!("file://{path}");
                locators.push(LocatorData {
                    code: LocatorCode::Macx,
                    data_len: url.len() as u32,
                    data: url.into_bytes(),
                });
            }
            (DiskType::Differencing, None) => {
                return Err(VhdError::InvalidArgument(
                    "differencing image needs a parent".into(),
                ))
            }
            (_, Some(_)) => {
                return Err(VhdError::InvalidArgument(
                    "only differencing images have a parent".into(),
                ))
            }
            _ => {}
        }

        footer.data_offset = SECTOR_SIZE as u64;
        Self::format(dev, footer, header, opts.batmap, locators)
    }

    /// Lays out and writes the metadata region of a sparse image: footer copy, header,
    /// empty BAT, optional batmap, parent locators, then the trailing footer.
    pub(crate) fn format(
        dev: D,
        mut footer: Footer,
        mut header: Header,
        with_batmap: bool,
        locators: Vec<LocatorData>,
    ) -> Result<Self> {
        if locators.len() > PARENT_LOCATOR_COUNT {
            return Err(VhdError::InvalidArgument("too many parent locators".into()));
        }
        footer.data_offset = SECTOR_SIZE as u64;
        header.table_offset = BAT_OFFSET;

        let mut next = BAT_OFFSET
            .checked_add(Bat::disk_size(header.max_bat_size)?)
            .ok_or(VhdError::OffsetOverflow)?;

        let batmap = if with_batmap {
            let bm = Batmap::new(next + SECTOR_SIZE as u64, header.max_bat_size);
            next = bm.header.batmap_offset + bm.map_bytes();
            Some(bm)
        } else {
            None
        };

        header.locators = [ParentLocator::EMPTY; PARENT_LOCATOR_COUNT];
        for (slot, loc) in header.locators.iter_mut().zip(&locators) {
            let space = align_up_u64(loc.data.len().max(1) as u64, SECTOR_SIZE as u64)?;
            *slot = ParentLocator {
                code: loc.code,
                data_space: space as u32,
                data_len: loc.data_len,
                reserved: 0,
                data_offset: next,
            };
            next += space;
        }

        let bat = Bat::new_unused(header.max_bat_size);
        let mut img = Self::from_parts(dev, footer, Some(header), bat, batmap);

        let raw = img.footer.to_bytes();
        img.dev.pwrite(&raw, 0)?;
        img.write_header()?;
        img.write_bat()?;
        img.write_batmap()?;
        for (i, loc) in locators.iter().enumerate() {
            let slot = img.header()?.locators[i];
            let mut buf = vec![0u8; slot.space_bytes() as usize];
            buf[..loc.data.len()].copy_from_slice(&loc.data);
            img.dev.pwrite(&buf, slot.data_offset)?;
        }
        let eod = img.end_of_data()?;
        img.write_footer_at(eod)?;
        Ok(img)
    }

    pub fn close(mut self) -> Result<()> {
        self.dev.close()
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// Name used in diagnostics: the path when known, the UUID otherwise.
    pub fn name(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => self.footer.uuid.to_string(),
        }
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn footer_mut(&mut self) -> &mut Footer {
        &mut self.footer
    }

    pub fn header(&self) -> Result<&Header> {
        self.header
            .as_ref()
            .ok_or(VhdError::NotSupported("fixed images have no sparse header"))
    }

    pub fn bat(&self) -> &Bat {
        &self.bat
    }

    pub fn batmap(&self) -> Option<&Batmap> {
        self.batmap.as_ref()
    }

    pub fn has_batmap(&self) -> bool {
        self.batmap.is_some()
    }

    pub fn uuid(&self) -> Uuid {
        self.footer.uuid
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.footer.current_size / SECTOR_SIZE as u64
    }

    pub fn block_size(&self) -> Result<u32> {
        Ok(self.header()?.block_size)
    }

    /// Sectors per block.
    pub fn spb(&self) -> Result<u64> {
        Ok(self.block_size()? as u64 / SECTOR_SIZE as u64)
    }

    /// Sectors occupied by a block's bitmap.
    pub fn bm_secs(&self) -> Result<u64> {
        Ok(bytes_to_sectors(bitmap_bytes(self.block_size()?)))
    }

    pub fn keyhash(&self) -> KeyHash {
        self.batmap
            .as_ref()
            .map(|b| b.header.keyhash.clone())
            .unwrap_or_default()
    }

    /// Places newly allocated blocks so that their data region starts on a page boundary.
    pub fn set_page_aligned(&mut self, on: bool) {
        self.page_aligned = on;
    }

    pub fn bind_cipher(&mut self, cipher: SectorCipher) {
        self.cipher = Some(cipher);
    }

    pub fn cipher(&self) -> Option<&SectorCipher> {
        self.cipher.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.dev.is_writable()
    }

    fn batmap_header_offset(&self) -> Result<u64> {
        let h = self.header()?;
        h.table_offset
            .checked_add(Bat::disk_size(h.max_bat_size)?)
            .ok_or(VhdError::OffsetOverflow)
    }

    /// End of the metadata region (footer copy, header, BAT, batmap, locators).
    pub fn end_of_headers(&self) -> Result<u64> {
        let Some(h) = &self.header else {
            return Ok(0);
        };
        let mut end = (SECTOR_SIZE as u64).max(self.footer.data_offset + HEADER_SIZE as u64);
        end = end.max(
            h.table_offset
                .checked_add(Bat::disk_size(h.max_bat_size)?)
                .ok_or(VhdError::OffsetOverflow)?,
        );
        if let Some(bm) = &self.batmap {
            end = end.max(self.batmap_header_offset()? + SECTOR_SIZE as u64);
            end = end.max(bm.header.batmap_offset + bm.map_bytes());
        }
        for loc in h.locators.iter().filter(|l| l.is_used()) {
            end = end.max(
                loc.data_offset
                    .checked_add(loc.space_bytes())
                    .ok_or(VhdError::OffsetOverflow)?,
            );
        }
        Ok(end)
    }

    /// End of the last allocated block, or of the metadata region when nothing is
    /// allocated. The trailing footer lives here.
    pub fn end_of_data(&self) -> Result<u64> {
        if self.header.is_none() {
            return Ok(self.footer.current_size);
        }
        let block_secs = self.bm_secs()? + self.spb()?;
        let mut end = self.end_of_headers()?;
        for (_, sector) in self.bat.allocated() {
            end = end.max(sectors_to_bytes(sector as u64 + block_secs)?);
        }
        Ok(end)
    }

    /// Writes the footer copy at offset 0 (sparse images) and the primary at end of data.
    pub fn write_footer(&mut self) -> Result<()> {
        let raw = self.footer.to_bytes();
        if self.footer.disk_type.is_sparse() {
            self.dev.pwrite(&raw, 0)?;
        }
        let end = self.end_of_data()?;
        self.dev.pwrite(&raw, end)
    }

    pub fn write_footer_at(&mut self, offset: u64) -> Result<()> {
        let raw = self.footer.to_bytes();
        self.dev.pwrite(&raw, offset)
    }

    pub fn write_header(&mut self) -> Result<()> {
        let offset = self.footer.data_offset;
        let raw = match self.header.as_mut() {
            Some(h) => h.to_bytes(),
            None => return Err(VhdError::NotSupported("fixed images have no sparse header")),
        };
        self.dev.pwrite(&raw, offset)
    }

    pub fn write_bat(&mut self) -> Result<()> {
        let offset = self.header()?.table_offset;
        let raw = self.bat.to_bytes()?;
        self.dev.pwrite(&raw, offset)
    }

    /// Writes the batmap header sector and map; a no-op without a batmap.
    pub fn write_batmap(&mut self) -> Result<()> {
        let Some(bm) = &self.batmap else {
            return Ok(());
        };
        let hdr = bm.header.to_bytes();
        let map = bm.map().to_vec();
        let map_offset = bm.header.batmap_offset;
        let hdr_offset = self.batmap_header_offset()?;
        self.dev.pwrite(&hdr, hdr_offset)?;
        self.dev.pwrite(&map, map_offset)
    }

    /// Stores `keyhash` in the batmap header. Images without a batmap cannot carry one.
    pub fn set_keyhash(&mut self, keyhash: &KeyHash) -> Result<()> {
        let hdr_offset = self.batmap_header_offset()?;
        let bm = self
            .batmap
            .as_mut()
            .ok_or(VhdError::NotSupported("image has no batmap to hold a keyhash"))?;
        bm.header.keyhash = keyhash.clone();
        let raw = bm.header.to_bytes();
        self.dev.pwrite(&raw, hdr_offset)
    }

    /// Records a fresh keyhash for `key`.
    pub fn set_key(&mut self, key: &Key) -> Result<KeyHash> {
        let kh = KeyHash::generate(key);
        self.set_keyhash(&kh)?;
        Ok(kh)
    }

    /// Re-reads the primary footer at the end of the device.
    pub fn read_primary_footer(&mut self) -> Result<Footer> {
        let len = self
            .dev
            .size()?
            .ok_or(VhdError::NotSeekable("primary footer of a stream"))?;
        let off = len
            .checked_sub(FOOTER_SIZE as u64)
            .ok_or(VhdError::NotVhd("image smaller than a footer"))?;
        let mut raw = [0u8; FOOTER_SIZE];
        self.dev.pread(&mut raw, off)?;
        Footer::parse(&raw)
    }

    pub fn print_headers(&self, hex: bool) -> String {
        let mut out = self.footer.describe(hex);
        if let Some(h) = &self.header {
            out.push('\n');
            out.push_str(&h.describe(hex));
        }
        if let Some(bm) = &self.batmap {
            out.push('\n');
            out.push_str("VHD Batmap Summary:\n-------------------\n");
            out.push_str(&format!(
                "Batmap offset       : {}\nBatmap size (secs)  : {}\nBatmap version      : {:#010x}\nChecksum            : {:#010x}\n",
                bm.header.batmap_offset, bm.header.batmap_size, bm.header.version, bm.header.checksum
            ));
            if bm.header.keyhash.is_present() {
                out.push_str(&format!(
                    "Keyhash             : {}\n",
                    bm.header.keyhash.hash_hex()
                ));
            }
        }
        out
    }

    fn block_offset(&self, block: u32) -> Result<Option<u64>> {
        match self.bat.get(block)? {
            Some(sector) => Ok(Some(sectors_to_bytes(sector as u64)?)),
            None => Ok(None),
        }
    }

    /// Bitmap of an allocated block.
    pub fn read_bitmap(&mut self, block: u32) -> Result<Arc<Vec<u8>>> {
        if let Some(v) = self.bitmap_cache.get(&block) {
            return Ok(v.clone());
        }
        let offset = self
            .block_offset(block)?
            .ok_or(VhdError::InvalidState(format!("block {block} is not allocated")))?;
        let len = sectors_to_bytes(self.bm_secs()?)?;
        if len > MAX_BITMAP_BYTES {
            return Err(VhdError::Unsupported("bitmap too large"));
        }
        let mut bm = vec![0u8; to_usize(len, "bitmap too large")?];
        self.dev.pread(&mut bm, offset)?;
        let bm = Arc::new(bm);
        self.bitmap_cache.push(block, bm.clone());
        Ok(bm)
    }

    pub fn write_bitmap(&mut self, block: u32, bm: &[u8]) -> Result<()> {
        let offset = self
            .block_offset(block)?
            .ok_or(VhdError::InvalidState(format!("block {block} is not allocated")))?;
        let len = to_usize(sectors_to_bytes(self.bm_secs()?)?, "bitmap too large")?;
        if bm.len() != len {
            return Err(VhdError::InvalidArgument(format!(
                "bitmap is {} bytes, expected {len}",
                bm.len()
            )));
        }
        self.dev.pwrite(bm, offset)?;
        self.bitmap_cache.push(block, Arc::new(bm.to_vec()));
        Ok(())
    }

    /// Writes the data region of an allocated block, starting at its first sector.
    pub fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        sector_aligned_len(data.len())?;
        if data.len() as u64 > self.block_size()? as u64 {
            return Err(VhdError::InvalidArgument("block data exceeds block size".into()));
        }
        let offset = self.block_data_offset(block, 0)?;
        self.dev.pwrite(data, offset)
    }

    fn block_data_offset(&self, block: u32, sector: u64) -> Result<u64> {
        let base = self
            .bat
            .get(block)?
            .ok_or(VhdError::InvalidState(format!("block {block} is not allocated")))?;
        sectors_to_bytes(base as u64 + self.bm_secs()? + sector)
    }

    /// Reads sectors of an allocated block as stored, without decryption.
    pub fn read_block_raw(&mut self, block: u32, sector: u64, buf: &mut [u8]) -> Result<()> {
        sector_aligned_len(buf.len())?;
        let offset = self.block_data_offset(block, sector)?;
        self.dev.pread(buf, offset)
    }

    /// Whether the batmap records `block` as fully allocated.
    pub fn batmap_test(&self, block: u32) -> bool {
        self.batmap.as_ref().is_some_and(|b| b.test(block))
    }

    /// Runs of allocated / unallocated sectors in `first..first + count`. Sectors beyond
    /// the capacity are reported unallocated.
    pub fn allocated_runs(&mut self, first: u64, count: u64) -> Result<Vec<Run>> {
        let end = first.checked_add(count).ok_or(VhdError::OffsetOverflow)?;
        let cap = self.capacity_sectors();
        let mut out: Vec<Run> = Vec::new();
        let mut push = |run: Run| match out.last_mut() {
            Some(last) if last.set == run.set && last.end() == run.start => last.len += run.len,
            _ => out.push(run),
        };

        if self.header.is_none() {
            let alloc_end = end.min(cap).max(first);
            if alloc_end > first {
                push(Run { start: first, len: alloc_end - first, set: true });
            }
            if end > alloc_end {
                push(Run { start: alloc_end, len: end - alloc_end, set: false });
            }
            return Ok(out);
        }

        let spb = self.spb()?;
        let mut sec = first;
        while sec < end {
            let block = sec / spb;
            let within = sec % spb;
            let n = (spb - within).min(end - sec);
            if sec >= cap || block >= self.bat.len() as u64 {
                push(Run { start: sec, len: end - sec, set: false });
                break;
            }
            let block = block as u32;
            if self.bat.get(block)?.is_none() {
                push(Run { start: sec, len: n, set: false });
            } else {
                let bm = self.read_bitmap(block)?;
                for r in bitmap::runs(&bm, within, n) {
                    push(Run {
                        start: block as u64 * spb + r.start,
                        len: r.len,
                        set: r.set,
                    });
                }
            }
            sec += n;
        }
        Ok(out)
    }

    /// Reads sectors of this image alone. Unallocated sectors read as zeros.
    pub fn read_sectors(&mut self, first: u64, buf: &mut [u8]) -> Result<()> {
        sector_aligned_len(buf.len())?;
        checked_range(
            sectors_to_bytes(first)?,
            buf.len(),
            self.footer.current_size,
        )?;
        if buf.is_empty() {
            return Ok(());
        }
        let count = (buf.len() / SECTOR_SIZE) as u64;

        if self.header.is_none() {
            self.dev.pread(buf, sectors_to_bytes(first)?)?;
            return self.decrypt_in_place(first, buf);
        }

        let spb = self.spb()?;
        for run in self.allocated_runs(first, count)? {
            let lo = ((run.start - first) as usize) * SECTOR_SIZE;
            let hi = lo + run.len as usize * SECTOR_SIZE;
            let chunk = &mut buf[lo..hi];
            if !run.set {
                chunk.fill(0);
                continue;
            }
            // Merged runs may span blocks that are not adjacent on disk.
            let mut sec = run.start;
            let mut rest = chunk;
            while !rest.is_empty() {
                let within = sec % spb;
                let n = ((spb - within) as usize * SECTOR_SIZE).min(rest.len());
                let (head, tail) = rest.split_at_mut(n);
                self.read_block_raw((sec / spb) as u32, within, head)?;
                self.decrypt_in_place(sec, head)?;
                sec += (n / SECTOR_SIZE) as u64;
                rest = tail;
            }
        }
        Ok(())
    }

    /// Writes sectors, allocating blocks on first touch.
    pub fn write_sectors(&mut self, first: u64, buf: &[u8]) -> Result<()> {
        if !self.dev.is_writable() {
            return Err(VhdError::ReadOnly);
        }
        sector_aligned_len(buf.len())?;
        checked_range(
            sectors_to_bytes(first)?,
            buf.len(),
            self.footer.current_size,
        )?;
        if buf.is_empty() {
            return Ok(());
        }

        if self.header.is_none() {
            let data = self.encrypt_copy(first, buf)?;
            return self.dev.pwrite(&data, sectors_to_bytes(first)?);
        }

        let spb = self.spb()?;
        let count = (buf.len() / SECTOR_SIZE) as u64;
        let mut done = 0u64;
        while done < count {
            let sec = first + done;
            let block = (sec / spb) as u32;
            let within = sec % spb;
            let n = (spb - within).min(count - done);

            if self.bat.get(block)?.is_none() {
                self.allocate_block(block)?;
            }

            let lo = done as usize * SECTOR_SIZE;
            let hi = lo + n as usize * SECTOR_SIZE;
            let data = self.encrypt_copy(sec, &buf[lo..hi])?;
            let offset = self.block_data_offset(block, within)?;
            self.dev.pwrite(&data, offset)?;
            self.mark_sectors(block, within, n)?;
            done += n;
        }
        Ok(())
    }

    fn encrypt_copy(&self, first: u64, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        if let Some(c) = &self.cipher {
            c.encrypt(first, &mut out)?;
        }
        Ok(out)
    }

    fn decrypt_in_place(&self, first: u64, buf: &mut [u8]) -> Result<()> {
        match &self.cipher {
            Some(c) => c.decrypt(first, buf),
            None => Ok(()),
        }
    }

    /// Sets bitmap bits `within..within + n` of `block` and writes back the touched bytes;
    /// updates the batmap once the block is full.
    fn mark_sectors(&mut self, block: u32, within: u64, n: u64) -> Result<()> {
        let mut bm = self.read_bitmap(block)?.as_ref().clone();
        for bit in within..within + n {
            bitmap::set_bit(&mut bm, bit);
        }
        let lo = (within / 8) as usize;
        let hi = ((within + n).div_ceil(8) as usize).min(bm.len());
        let offset = self
            .block_offset(block)?
            .ok_or(VhdError::InvalidState(format!("block {block} is not allocated")))?;
        self.dev.pwrite(&bm[lo..hi], offset + lo as u64)?;

        let full = bitmap::all_set(&bm, self.spb()?);
        self.bitmap_cache.push(block, Arc::new(bm));

        if full && self.batmap.is_some() && !self.batmap_test(block) {
            self.mark_block_full(block)?;
        }
        Ok(())
    }

    fn mark_block_full(&mut self, block: u32) -> Result<()> {
        let hdr_offset = self.batmap_header_offset()?;
        let Some(bm) = self.batmap.as_mut() else {
            return Ok(());
        };
        let idx = bm.set(block)?;
        let byte = [bm.map()[idx]];
        let map_offset = bm.header.batmap_offset + idx as u64;
        let hdr = bm.header.to_bytes();
        self.dev.pwrite(&byte, map_offset)?;
        self.dev.pwrite(&hdr, hdr_offset)
    }

    /// Appends a block at the end of data: zeroed bitmap, then the trailing footer, then
    /// the BAT entry. Returns the block's sector offset.
    fn allocate_block(&mut self, block: u32) -> Result<u32> {
        if self.bat.get(block)?.is_some() {
            return Err(VhdError::InvalidState(format!(
                "block {block} is already allocated"
            )));
        }
        let bm_secs = self.bm_secs()?;
        let spb = self.spb()?;
        let mut sector = bytes_to_sectors(self.end_of_data()?);
        if self.page_aligned {
            let spp = (PAGE_SIZE / SECTOR_SIZE) as u64;
            sector += (spp - (sector + bm_secs) % spp) % spp;
        }
        let end = sector + bm_secs + spb;
        let entry: u32 = sector
            .try_into()
            .ok()
            .filter(|s| *s != u32::MAX && end <= u32::MAX as u64)
            .ok_or(VhdError::Unsupported("image exceeds 32-bit sector addressing"))?;

        let zero = vec![0u8; to_usize(sectors_to_bytes(bm_secs)?, "bitmap too large")?];
        self.dev.pwrite(&zero, sectors_to_bytes(sector)?)?;
        self.write_footer_at(sectors_to_bytes(end)?)?;

        self.bat.set(block, entry)?;
        let table_offset = self.header()?.table_offset;
        self.dev
            .pwrite(&entry.to_be_bytes(), table_offset + block as u64 * 4)?;
        self.bitmap_cache.push(block, Arc::new(zero));
        tracing::trace!(uuid = %self.footer.uuid, block, sector, "allocated block");
        Ok(entry)
    }

    /// Reads the raw payload of a parent locator.
    pub(crate) fn read_locator(&mut self, loc: &ParentLocator) -> Result<Vec<u8>> {
        let space = loc.space_bytes();
        let len = if loc.data_len == 0 || loc.data_len as u64 > space {
            space
        } else {
            loc.data_len as u64
        };
        if len == 0 || len > 64 * 1024 {
            return Err(VhdError::Corrupt("parent locator size invalid"));
        }
        let len = len as usize;
        if let Some((_, data)) = self
            .locator_data
            .iter()
            .find(|(off, data)| *off == loc.data_offset && data.len() >= len)
        {
            return Ok(data[..len].to_vec());
        }
        let mut buf = vec![0u8; len];
        self.dev.pread(&mut buf, loc.data_offset)?;
        Ok(buf)
    }
}

fn bitmap_bytes(block_size: u32) -> u64 {
    let spb = block_size as u64 / SECTOR_SIZE as u64;
    spb.div_ceil(8)
}

fn read_footer<D: DeviceIo>(dev: &mut D, size: Option<u64>) -> Result<Footer> {
    let mut raw = [0u8; FOOTER_SIZE];
    let Some(len) = size else {
        dev.pread(&mut raw, 0)?;
        return Footer::parse(&raw);
    };
    if len < FOOTER_SIZE as u64 {
        return Err(VhdError::NotVhd("image smaller than a footer"));
    }
    dev.pread(&mut raw, len - FOOTER_SIZE as u64)?;
    let primary_err = match Footer::parse(&raw) {
        Ok(f) => return Ok(f),
        Err(e) => e,
    };
    if len >= 2 * FOOTER_SIZE as u64 {
        dev.pread(&mut raw, 0)?;
        if let Ok(f) = Footer::parse(&raw) {
            if f.disk_type.is_sparse() {
                tracing::warn!(uuid = %f.uuid, error = %primary_err, "primary footer invalid, using backup");
                return Ok(f);
            }
        }
    }
    Err(primary_err)
}

/// Metadata found between the end of the BAT and the first data block.
struct MetadataTail {
    batmap: Option<Batmap>,
    locators: Vec<(u64, Vec<u8>)>,
}

/// Reads the region after the BAT in one forward pass: batmap header, batmap and the
/// payloads of parent locators placed after the BAT.
fn read_metadata_tail<D: DeviceIo>(
    dev: &mut D,
    size: Option<u64>,
    footer: &Footer,
    header: &Header,
    bat: &Bat,
) -> Result<MetadataTail> {
    let bat_end = header
        .table_offset
        .checked_add(Bat::disk_size(header.max_bat_size)?)
        .ok_or(VhdError::OffsetOverflow)?;

    let probe = footer.created_by_tap() && footer.creator_version >= CREATOR_VERSION_BATMAP_PROBE;
    let mut end = if probe {
        bat_end + SECTOR_SIZE as u64
    } else {
        bat_end
    };
    for loc in header.locators.iter().filter(|l| l.is_used()) {
        if loc.data_offset >= bat_end {
            let loc_end = loc
                .data_offset
                .checked_add(loc.space_bytes())
                .ok_or(VhdError::OffsetOverflow)?;
            end = end.max(loc_end);
        }
    }
    if end - bat_end > MAX_METADATA_TAIL_BYTES {
        end = bat_end + if probe { SECTOR_SIZE as u64 } else { 0 };
    }
    if let Some(len) = size {
        end = end.min(len.saturating_sub(FOOTER_SIZE as u64)).max(bat_end);
    }
    // Block bitmaps past this point are read later, in order.
    if let Some(first_block) = bat.allocated().map(|(_, sector)| sector).min() {
        end = end.min(sectors_to_bytes(first_block as u64)?).max(bat_end);
    }

    let mut tail = vec![0u8; to_usize(end - bat_end, "metadata too large")?];
    match dev.pread(&mut tail, bat_end) {
        Ok(()) => {}
        Err(VhdError::ShortIo { .. }) => tail.clear(),
        Err(e) => return Err(e),
    }

    let locators = header
        .locators
        .iter()
        .filter(|l| l.is_used() && l.data_offset >= bat_end)
        .filter_map(|l| {
            let lo = (l.data_offset - bat_end) as usize;
            let hi = lo.checked_add(l.space_bytes() as usize)?;
            tail.get(lo..hi).map(|b| (l.data_offset, b.to_vec()))
        })
        .collect();

    let hdr = match tail.get(..SECTOR_SIZE) {
        Some(raw) if probe => {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(raw);
            BatmapHeader::parse(&sector)?
        }
        _ => None,
    };
    let Some(hdr) = hdr else {
        if probe && footer.creator_version >= CREATOR_VERSION_BATMAP {
            tracing::debug!(uuid = %footer.uuid, "no batmap header after bat");
        }
        return Ok(MetadataTail { batmap: None, locators });
    };

    let len = sectors_to_bytes(hdr.batmap_size as u64)?;
    if len > MAX_BITMAP_BYTES || hdr.batmap_offset < bat_end + SECTOR_SIZE as u64 {
        return Err(VhdError::Corrupt("batmap location invalid"));
    }
    if (hdr.batmap_size as u64) < bytes_to_sectors((header.max_bat_size as u64).div_ceil(8)) {
        return Err(VhdError::Corrupt("batmap too small for bat"));
    }
    let lo = (hdr.batmap_offset - bat_end) as usize;
    let len = to_usize(len, "batmap too large")?;
    let map = match tail.get(lo..lo + len) {
        Some(map) => map.to_vec(),
        None => {
            let mut map = vec![0u8; len];
            dev.pread(&mut map, hdr.batmap_offset)?;
            map
        }
    };
    let batmap = Batmap::from_parts(hdr, map)?;
    Ok(MetadataTail {
        batmap: Some(batmap),
        locators,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::crypto::Key;

    const MIB: u64 = 1024 * 1024;

    fn small_dynamic(capacity: u64) -> VhdImage<MemDevice> {
        let opts = CreateOptions::dynamic(capacity).with_block_size(64 * 1024);
        VhdImage::create_on(MemDevice::new(), &opts).unwrap()
    }

    fn reopen(img: VhdImage<MemDevice>) -> VhdImage<MemDevice> {
        VhdImage::open(img.into_device()).unwrap()
    }

    #[test]
    fn fresh_image_reads_zeros_without_allocating() {
        let mut img = small_dynamic(MIB);
        let eod = img.end_of_data().unwrap();
        let mut buf = vec![0xaa; 4 * SECTOR_SIZE];
        img.read_sectors(10, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        img.read_sectors(10, &mut buf).unwrap();
        assert_eq!(img.bat().allocated_count(), 0);
        assert_eq!(img.end_of_data().unwrap(), eod);
    }

    #[test]
    fn write_allocates_at_end_of_data_and_sets_exact_bits() {
        let mut img = small_dynamic(MIB);
        let eod = img.end_of_data().unwrap();
        let data = vec![0x42; 3 * SECTOR_SIZE];
        img.write_sectors(130, &data).unwrap();

        // 64 KiB blocks: 128 sectors each, sector 130 lives in block 1.
        assert_eq!(img.bat().get(1).unwrap(), Some((eod / 512) as u32));
        let bm = img.read_bitmap(1).unwrap();
        for s in 0..128 {
            assert_eq!(bitmap::test_bit(&bm, s), (2..5).contains(&s), "sector {s}");
        }

        let mut img = reopen(img);
        let mut back = vec![0u8; 5 * SECTOR_SIZE];
        img.read_sectors(128, &mut back).unwrap();
        assert!(back[..2 * SECTOR_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&back[2 * SECTOR_SIZE..], &data[..]);
    }

    #[test]
    fn reads_follow_the_bat_across_block_boundaries() {
        let mut img = small_dynamic(MIB);
        // Block 1 is allocated before block 0, so block 0 sits last on disk.
        img.write_sectors(128, &[0xbb; SECTOR_SIZE]).unwrap();
        img.write_sectors(127, &[0xaa; SECTOR_SIZE]).unwrap();

        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        img.read_sectors(127, &mut buf).unwrap();
        assert_eq!(&buf[..SECTOR_SIZE], &[0xaa; SECTOR_SIZE][..]);
        assert_eq!(&buf[SECTOR_SIZE..], &[0xbb; SECTOR_SIZE][..]);

        let mut img = reopen(img);
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        img.read_sectors(127, &mut buf).unwrap();
        assert_eq!(&buf[SECTOR_SIZE..], &[0xbb; SECTOR_SIZE][..]);
    }

    #[test]
    fn writes_spanning_three_blocks_read_back_whole() {
        let mut img = small_dynamic(MIB);
        img.write_sectors(300, &[1u8; SECTOR_SIZE]).unwrap();
        let data: Vec<u8> = (0..260 * SECTOR_SIZE).map(|i| (i / SECTOR_SIZE) as u8).collect();
        img.write_sectors(60, &data).unwrap();
        assert_eq!(img.bat().allocated_count(), 3);

        let mut back = vec![0u8; data.len()];
        img.read_sectors(60, &mut back).unwrap();
        assert!(back == data, "data differs across block boundaries");
    }

    #[test]
    fn allocations_grow_monotonically() {
        let mut img = small_dynamic(MIB);
        let mut last = img.end_of_data().unwrap();
        for block in [5u64, 0, 9] {
            img.write_sectors(block * 128, &[1u8; SECTOR_SIZE]).unwrap();
            let sector = img.bat().get(block as u32).unwrap().unwrap() as u64 * 512;
            assert!(sector >= last);
            last = img.end_of_data().unwrap();
        }
        let img = reopen(img);
        assert_eq!(img.bat().allocated_count(), 3);
    }

    #[test]
    fn full_block_sets_batmap_bit() {
        let mut img = small_dynamic(MIB);
        img.write_sectors(0, &vec![7u8; 127 * SECTOR_SIZE]).unwrap();
        assert!(!img.batmap_test(0));
        img.write_sectors(127, &[7u8; SECTOR_SIZE]).unwrap();
        assert!(img.batmap_test(0));

        let img = reopen(img);
        assert!(img.batmap_test(0));
        assert!(!img.batmap_test(1));
    }

    #[test]
    fn page_aligned_allocation_aligns_data_region() {
        let mut img = small_dynamic(MIB);
        img.set_page_aligned(true);
        img.write_sectors(0, &[1u8; SECTOR_SIZE]).unwrap();
        let sector = img.bat().get(0).unwrap().unwrap() as u64;
        assert_eq!((sector + img.bm_secs().unwrap()) % 8, 0);
    }

    #[test]
    fn out_of_range_and_read_only_requests_fail() {
        let mut img = small_dynamic(MIB);
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert!(matches!(
            img.read_sectors(2048, &mut buf).unwrap_err(),
            VhdError::OutOfBounds { .. }
        ));
        assert!(matches!(
            img.read_sectors(0, &mut [0u8; 100]).unwrap_err(),
            VhdError::UnalignedLength { .. }
        ));

        let dev = img.into_device().read_only();
        let mut ro = VhdImage::open(dev).unwrap();
        assert!(matches!(
            ro.write_sectors(0, &buf).unwrap_err(),
            VhdError::ReadOnly
        ));
    }

    #[test]
    fn backup_footer_is_used_when_primary_is_damaged() {
        let img = small_dynamic(MIB);
        let uuid = img.uuid();
        let mut bytes = img.into_device().into_vec();
        let n = bytes.len();
        bytes[n - 10] ^= 0xff;
        let img = VhdImage::open(MemDevice::from_vec(bytes)).unwrap();
        assert_eq!(img.uuid(), uuid);
    }

    #[test]
    fn fixed_images_store_data_in_place() {
        let opts = CreateOptions::fixed(64 * 1024);
        let mut img = VhdImage::create_on(MemDevice::new(), &opts).unwrap();
        img.write_sectors(3, &[9u8; SECTOR_SIZE]).unwrap();
        let bytes = img.into_device().into_vec();
        assert_eq!(bytes.len(), 64 * 1024 + FOOTER_SIZE);
        assert!(bytes[3 * 512..4 * 512].iter().all(|b| *b == 9));

        let mut img = VhdImage::open(MemDevice::from_vec(bytes)).unwrap();
        assert_eq!(img.disk_type(), DiskType::Fixed);
        let mut buf = vec![0u8; SECTOR_SIZE];
        img.read_sectors(3, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 9));
    }

    #[test]
    fn bound_cipher_encrypts_on_disk_and_decrypts_on_read() {
        let mut img = small_dynamic(MIB);
        let key = Key::new(vec![5u8; 64]).unwrap();
        img.set_key(&key).unwrap();
        img.bind_cipher(SectorCipher::new(&key).unwrap());

        let data = vec![0x61; 2 * SECTOR_SIZE];
        img.write_sectors(300, &data).unwrap();
        let mut raw = vec![0u8; 2 * SECTOR_SIZE];
        img.read_block_raw(2, 300 - 256, &mut raw).unwrap();
        assert_ne!(raw, data);

        let mut back = vec![0u8; 2 * SECTOR_SIZE];
        img.read_sectors(300, &mut back).unwrap();
        assert_eq!(back, data);

        let img = reopen(img);
        assert!(img.keyhash().is_present());
    }

    #[test]
    fn keyhash_needs_a_batmap() {
        let opts = CreateOptions::dynamic(MIB)
            .with_block_size(64 * 1024)
            .without_batmap();
        let mut img = VhdImage::create_on(MemDevice::new(), &opts).unwrap();
        assert!(!img.has_batmap());
        let key = Key::new(vec![5u8; 32]).unwrap();
        assert!(matches!(
            img.set_key(&key).unwrap_err(),
            VhdError::NotSupported(_)
        ));
        let img = reopen(img);
        assert!(!img.has_batmap());
        assert!(!img.keyhash().is_present());
    }
}
