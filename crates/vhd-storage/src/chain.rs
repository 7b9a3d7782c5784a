//! Parent linkage between differencing images.
//!
//! A differencing image names its parent twice: by UUID in the sparse header and by path in
//! one or more parent locators. Paths come from the locators; the UUID is what gets
//! trusted.

use std::path::{Path, PathBuf};

use crate::crypto::{check_key, keyfile_stem, Key, KeyDirs, KeyHash, Keystore, SectorCipher};
use crate::device::{DeviceIo, FileDevice};
use crate::format::{DiskType, LocatorCode};
use crate::vhd::{OpenMode, VhdImage};
use crate::{Result, VhdError, SECTOR_SIZE};

const FILE_URL_PREFIX: &str = "file://";

/// True when a differencing image sits on a raw (non-VHD) parent.
pub fn parent_is_raw<D>(image: &VhdImage<D>) -> bool {
    image
        .header
        .as_ref()
        .is_some_and(|h| h.parent_uuid.is_nil())
}

fn decode_locator(code: LocatorCode, raw: &[u8]) -> Option<String> {
    let text = match code {
        LocatorCode::Macx => String::from_utf8_lossy(raw).into_owned(),
        LocatorCode::W2ku | LocatorCode::W2ru => {
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        LocatorCode::None | LocatorCode::Other(_) => return None,
    };
    let text = text.trim_end_matches('\0');
    let text = text.strip_prefix(FILE_URL_PREFIX).unwrap_or(text);
    (!text.is_empty()).then(|| text.to_string())
}

/// Resolves the parent path of a differencing image from its locators. Relative paths are
/// taken relative to the child's directory; the first candidate that exists wins.
pub fn parent_locator_path<D: DeviceIo>(child: &mut VhdImage<D>) -> Result<PathBuf> {
    let locators = child.header()?.locators;
    let base = child
        .path()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    for loc in locators.iter().filter(|l| l.is_used()) {
        let raw = match child.read_locator(loc) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(uuid = %child.uuid(), error = %e, "unreadable parent locator");
                continue;
            }
        };
        let Some(text) = decode_locator(loc.code, &raw) else {
            continue;
        };
        let candidate = Path::new(&text);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            base.join(candidate)
        };
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::debug!(uuid = %child.uuid(), candidate = %candidate.display(), "parent locator target missing");
    }
    Err(VhdError::BrokenChain(format!(
        "parent of {} not found",
        child.name()
    )))
}

/// Opens the parent of `child` read-only. Returns `None` for non-differencing images and
/// raw parents.
pub fn open_parent<D: DeviceIo>(child: &mut VhdImage<D>) -> Result<Option<VhdImage<FileDevice>>> {
    if child.disk_type() != DiskType::Differencing || parent_is_raw(child) {
        return Ok(None);
    }
    let path = parent_locator_path(child)?;
    let parent = VhdImage::open_path(&path, OpenMode::ReadOnly)?;
    let expected = child.header()?.parent_uuid;
    if parent.uuid() != expected {
        return Err(VhdError::BrokenChain(format!(
            "{} expects parent {expected}, {} is {}",
            child.name(),
            path.display(),
            parent.uuid()
        )));
    }
    Ok(Some(parent))
}

/// A leaf image and its opened ancestors, nearest first.
///
/// Ancestors are closed in reverse open order when the chain is dropped.
pub struct ImageChain<D: DeviceIo> {
    leaf: VhdImage<D>,
    ancestors: Vec<VhdImage<FileDevice>>,
}

impl<D: DeviceIo> ImageChain<D> {
    pub fn open(mut leaf: VhdImage<D>) -> Result<Self> {
        let mut ancestors = Vec::new();
        let mut next = open_parent(&mut leaf)?;
        while let Some(mut parent) = next {
            next = open_parent(&mut parent)?;
            ancestors.push(parent);
        }
        Ok(Self { leaf, ancestors })
    }

    pub fn leaf(&self) -> &VhdImage<D> {
        &self.leaf
    }

    pub fn leaf_mut(&mut self) -> &mut VhdImage<D> {
        &mut self.leaf
    }

    pub fn ancestors(&self) -> &[VhdImage<FileDevice>] {
        &self.ancestors
    }

    /// Number of images, leaf included.
    pub fn depth(&self) -> usize {
        1 + self.ancestors.len()
    }

    /// Binds each member's cipher, searching keys from that member up the chain.
    pub fn open_crypto(&mut self, key_dirs: Option<&KeyDirs>, keystore: &mut Keystore) -> Result<()> {
        open_crypto(&mut self.leaf, key_dirs, keystore)?;
        for img in &mut self.ancestors {
            open_crypto(img, key_dirs, keystore)?;
        }
        Ok(())
    }

    /// Reads sectors as seen through the chain: the nearest image holding a sector wins,
    /// sectors no image holds read as zeros.
    pub fn read_sectors(&mut self, first: u64, buf: &mut [u8]) -> Result<()> {
        let count = (buf.len() / SECTOR_SIZE) as u64;
        crate::util::sector_aligned_len(buf.len())?;
        crate::util::checked_range(
            crate::util::sectors_to_bytes(first)?,
            buf.len(),
            self.leaf.capacity(),
        )?;
        for run in self.leaf.allocated_runs(first, count)? {
            let lo = (run.start - first) as usize * SECTOR_SIZE;
            let chunk = &mut buf[lo..lo + run.len as usize * SECTOR_SIZE];
            if run.set {
                self.leaf.read_sectors(run.start, chunk)?;
            } else {
                read_through(&mut self.ancestors, run.start, chunk)?;
            }
        }
        Ok(())
    }
}

fn read_through(chain: &mut [VhdImage<FileDevice>], first: u64, buf: &mut [u8]) -> Result<()> {
    let Some((img, rest)) = chain.split_first_mut() else {
        buf.fill(0);
        return Ok(());
    };
    let count = (buf.len() / SECTOR_SIZE) as u64;
    for run in img.allocated_runs(first, count)? {
        let lo = (run.start - first) as usize * SECTOR_SIZE;
        let chunk = &mut buf[lo..lo + run.len as usize * SECTOR_SIZE];
        if run.set {
            img.read_sectors(run.start, chunk)?;
        } else {
            read_through(rest, run.start, chunk)?;
        }
    }
    Ok(())
}

impl<D: DeviceIo> Drop for ImageChain<D> {
    fn drop(&mut self) {
        while let Some(img) = self.ancestors.pop() {
            let name = img.name();
            if let Err(e) = img.close() {
                tracing::warn!(image = %name, error = %e, "failed to close ancestor");
            }
        }
    }
}

/// Orders a set of images from leaf to root so that each member's parent UUID names the
/// next member.
///
/// Exactly one member may be a head (no other member names it as parent); every member
/// but the last must be differencing.
pub fn sort_chain<D: DeviceIo>(images: &mut [VhdImage<D>]) -> Result<()> {
    if images.is_empty() {
        return Err(VhdError::InvalidArgument("empty chain".into()));
    }
    let n = images.len();

    let parent_of = |img: &VhdImage<D>| -> Option<uuid::Uuid> {
        (img.disk_type() == DiskType::Differencing)
            .then(|| img.header.as_ref().map(|h| h.parent_uuid))
            .flatten()
    };

    let parents: Vec<uuid::Uuid> = images.iter().filter_map(parent_of).collect();
    let heads: Vec<usize> = (0..n)
        .filter(|&i| !parents.contains(&images[i].uuid()))
        .collect();
    match heads.as_slice() {
        [head] => images.swap(0, *head),
        [] => return Err(VhdError::BrokenChain("no head image in chain".into())),
        many => {
            let names: Vec<String> = many.iter().map(|&i| images[i].name()).collect();
            return Err(VhdError::BrokenChain(format!(
                "multiple heads in chain: {}",
                names.join(", ")
            )));
        }
    }

    for i in 0..n - 1 {
        let Some(parent) = parent_of(&images[i]) else {
            return Err(VhdError::BrokenChain(format!(
                "{} is not a differencing image but has descendants in the chain",
                images[i].name()
            )));
        };
        let Some(j) = (i + 1..n).find(|&j| images[j].uuid() == parent) else {
            return Err(VhdError::BrokenChain(format!(
                "parent {parent} of {} is missing",
                images[i].name()
            )));
        };
        images.swap(i + 1, j);
    }

    for pair in images.windows(2) {
        if parent_of(&pair[0]) != Some(pair[1].uuid()) {
            return Err(VhdError::BrokenChain(format!(
                "{} is not the parent of {}",
                pair[1].name(),
                pair[0].name()
            )));
        }
    }
    Ok(())
}

/// Key material discovered for an image chain.
#[derive(Debug, Clone)]
pub struct KeyedImage {
    pub key: Key,
    pub keyhash: KeyHash,
    /// Image whose keyfile (or cached key) matched.
    pub image: String,
}

/// Walks from `leaf` toward the root and returns the key of the first keyed image.
///
/// With a key directory configured every link is checked for a keyfile, even one without
/// a keyhash, so a clear image swapped in for an encrypted one is caught. A link whose
/// keyfile is missing but that carries a keyhash falls back to `keystore`.
pub fn find_keyed_image<D: DeviceIo>(
    leaf: &mut VhdImage<D>,
    key_dirs: Option<&KeyDirs>,
    keystore: &mut Keystore,
) -> Result<Option<KeyedImage>> {
    if let Some(found) = examine_link(leaf, key_dirs, keystore)? {
        return Ok(Some(found));
    }
    let mut next = open_parent(leaf)?;
    while let Some(mut link) = next {
        if let Some(found) = examine_link(&link, key_dirs, keystore)? {
            return Ok(Some(found));
        }
        next = open_parent(&mut link)?;
    }
    Ok(None)
}

fn examine_link<D: DeviceIo>(
    link: &VhdImage<D>,
    key_dirs: Option<&KeyDirs>,
    keystore: &mut Keystore,
) -> Result<Option<KeyedImage>> {
    let keyhash = link.keyhash();
    let hashed = keyhash.is_present();

    let Some(dirs) = key_dirs else {
        if hashed {
            return Err(VhdError::NoKey(format!(
                "{} is encrypted but no key directory is configured",
                link.name()
            )));
        }
        return Ok(None);
    };

    let key = match link.path().and_then(keyfile_stem) {
        Some(stem) => dirs.read_key(&stem)?,
        None => None,
    };

    match key {
        Some(key) => {
            if !hashed {
                return Err(VhdError::UnexpectedKey(link.name()));
            }
            check_key(&key, &keyhash)?;
            tracing::debug!(image = %link.name(), "using key");
            keystore.add(&key, &keyhash);
            Ok(Some(KeyedImage {
                key,
                keyhash,
                image: link.name(),
            }))
        }
        None if hashed => match keystore.find(&keyhash) {
            Some(key) => {
                tracing::debug!(image = %link.name(), "using cached key");
                Ok(Some(KeyedImage {
                    key: key.clone(),
                    keyhash,
                    image: link.name(),
                }))
            }
            None => Err(VhdError::NoKey(link.name())),
        },
        None => Ok(None),
    }
}

/// Binds the chain's key to `image`. Returns the keyhash used, or `None` when the chain is
/// not encrypted. An already bound cipher is left alone.
pub fn open_crypto<D: DeviceIo>(
    image: &mut VhdImage<D>,
    key_dirs: Option<&KeyDirs>,
    keystore: &mut Keystore,
) -> Result<Option<KeyHash>> {
    if image.cipher().is_some() {
        return Ok(None);
    }
    let Some(found) = find_keyed_image(image, key_dirs, keystore)? else {
        return Ok(None);
    };
    image.bind_cipher(SectorCipher::new(&found.key)?);
    tracing::debug!(uuid = %image.uuid(), keyed = %found.image, bits = found.key.bits(), "cipher bound");
    Ok(Some(found.keyhash))
}
