use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Key, KEY_SIZES};
use crate::{Result, VhdError};

/// Environment variable listing key directories, comma separated.
pub const KEYDIR_ENV: &str = "TAPDISK2_CRYPTO_KEYDIR";

/// Ordered list of directories searched for keyfiles.
///
/// A keyfile for image `/any/path/<stem>.vhd` is named `<stem>,aes-xts-plain,<bits>.key`
/// and holds exactly `bits / 8` raw key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDirs {
    dirs: Vec<PathBuf>,
}

impl KeyDirs {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn parse(list: &str) -> Self {
        Self {
            dirs: list
                .split(',')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect(),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(KEYDIR_ENV).ok().map(|v| Self::parse(&v))
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Reads the keyfile for `stem`, preferring 512-bit keys over 256-bit ones.
    ///
    /// Returns `Ok(None)` when no keyfile exists in any directory.
    pub fn read_key(&self, stem: &str) -> Result<Option<Key>> {
        let mut last_err = None;
        for bits in KEY_SIZES {
            match self.read_key_of_size(stem, bits) {
                Ok(Some(key)) => return Ok(Some(key)),
                Ok(None) => {}
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn read_key_of_size(&self, stem: &str, bits: u32) -> Result<Option<Key>> {
        let name = format!("{stem},aes-xts-plain,{bits}.key");
        for dir in &self.dirs {
            let path = dir.join(&name);
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if bytes.len() != bits as usize / 8 {
                tracing::warn!(keyfile = %path.display(), len = bytes.len(), "keyfile has wrong size");
                return Err(VhdError::InvalidKey("keyfile size does not match its name"));
            }
            tracing::debug!(keyfile = %path.display(), bits, "using keyfile");
            return Key::new(bytes).map(Some);
        }
        Ok(None)
    }
}

/// Keyfile stem of an image: its file name cut at the first `.vhd`.
pub fn keyfile_stem(image: &Path) -> Option<String> {
    let name = image.file_name()?.to_string_lossy();
    let stem = match name.find(".vhd") {
        Some(idx) => &name[..idx],
        None => &name[..],
    };
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_commas() {
        let dirs = KeyDirs::parse("/a,/b/c,,/d");
        assert_eq!(
            dirs.dirs(),
            &[PathBuf::from("/a"), PathBuf::from("/b/c"), PathBuf::from("/d")]
        );
    }

    #[test]
    fn stem_cuts_at_vhd_extension() {
        assert_eq!(keyfile_stem(Path::new("/x/y/disk.vhd")).unwrap(), "disk");
        assert_eq!(keyfile_stem(Path::new("disk.vhd.bak")).unwrap(), "disk");
        assert_eq!(keyfile_stem(Path::new("/x/raw.img")).unwrap(), "raw.img");
    }

    #[test]
    fn prefers_512_bit_keys_across_directories() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("disk,aes-xts-plain,256.key"), [1u8; 32]).unwrap();
        std::fs::write(b.path().join("disk,aes-xts-plain,512.key"), [2u8; 64]).unwrap();

        let dirs = KeyDirs::new(vec![a.path().into(), b.path().into()]);
        let key = dirs.read_key("disk").unwrap().unwrap();
        assert_eq!(key.bits(), 512);
        assert_eq!(key.as_bytes(), &[2u8; 64]);

        assert!(dirs.read_key("other").unwrap().is_none());
    }

    #[test]
    fn truncated_keyfile_falls_back_then_reports() {
        let a = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("disk,aes-xts-plain,512.key"), [1u8; 10]).unwrap();
        let dirs = KeyDirs::new(vec![a.path().into()]);
        assert!(matches!(
            dirs.read_key("disk").unwrap_err(),
            VhdError::InvalidKey(_)
        ));

        std::fs::write(a.path().join("disk,aes-xts-plain,256.key"), [1u8; 32]).unwrap();
        assert_eq!(dirs.read_key("disk").unwrap().unwrap().bits(), 256);
    }
}
