use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::{clone_metadata_with, discard_output, CloneOptions, Progress};
use crate::bitmap::runs;
use crate::crypto::SectorCipher;
use crate::device::DeviceIo;
use crate::util::sectors_to_bytes;
use crate::vhd::VhdImage;
use crate::{Result, VhdError, SECTOR_SIZE};

/// Writes the allocated sectors of `src` to `raw_out` at their logical offsets.
///
/// Blocks are visited in physical order so `src` may be a forward-only stream. A block the
/// BAT allocates but whose bitmap is empty still gets one zero sector, keeping the extent
/// of the output in step with the image. With a `cipher`, data is encrypted before it is
/// written.
pub fn dm_encrypt<S: DeviceIo, R: DeviceIo>(
    src: &mut VhdImage<S>,
    raw_out: &mut R,
    cipher: Option<&SectorCipher>,
    progress: &mut dyn Progress,
) -> Result<()> {
    let order = src.bat().physical_order();
    progress.begin(order.len() as u64);
    for (block, _) in order {
        copy_block(src, raw_out, block, cipher).map_err(|e| {
            tracing::error!(uuid = %src.uuid(), block, error = %e, "encrypting block failed");
            e
        })?;
        progress.advance(1);
    }
    progress.finish();
    Ok(())
}

fn copy_block<S: DeviceIo, R: DeviceIo>(
    src: &mut VhdImage<S>,
    raw_out: &mut R,
    block: u32,
    cipher: Option<&SectorCipher>,
) -> Result<()> {
    let spb = src.spb()?;
    let first = block as u64 * spb;
    let bm = src.read_bitmap(block)?;

    let mut allocated = false;
    for run in runs(&bm, 0, spb).filter(|r| r.set) {
        let mut buf = vec![0u8; run.len as usize * SECTOR_SIZE];
        src.read_block_raw(block, run.start, &mut buf)?;
        if let Some(c) = cipher {
            c.encrypt(first + run.start, &mut buf)?;
        }
        raw_out.pwrite(&buf, sectors_to_bytes(first + run.start)?)?;
        allocated = true;
    }

    if !allocated {
        let mut zero = vec![0u8; SECTOR_SIZE];
        if let Some(c) = cipher {
            c.encrypt(first, &mut zero)?;
        }
        raw_out.pwrite(&zero, sectors_to_bytes(first)?)?;
    }
    Ok(())
}

/// Runs `command` through the shell, discarding its output. A non-zero exit is an error.
pub fn instantiate_output(command: &str) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()?;
    if let Some(mut out) = child.stdout.take() {
        io::copy(&mut out, &mut io::sink())?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(VhdError::Io(io::Error::other(format!(
            "`{command}` failed: {status}"
        ))));
    }
    Ok(())
}

/// An encryption run that can also produce a fresh, empty image for the encrypted data.
///
/// When `clone_to` is set, the source metadata is cloned there and `command` is run to
/// instantiate the raw target before it is opened. The clone is removed if the run fails.
#[derive(Debug, Clone, Default)]
pub struct EncryptJob {
    pub clone_to: Option<PathBuf>,
    pub command: Option<String>,
    /// Carry the source keyhash into the clone.
    pub keep_keyhash: bool,
}

impl EncryptJob {
    pub fn new(clone_to: Option<PathBuf>, command: Option<String>) -> Result<Self> {
        if clone_to.is_some() != command.is_some() {
            return Err(VhdError::InvalidArgument(
                "a cloned image and an instantiation command go together".into(),
            ));
        }
        Ok(Self {
            clone_to,
            command,
            keep_keyhash: false,
        })
    }

    pub fn with_keyhash(mut self, keep: bool) -> Self {
        self.keep_keyhash = keep;
        self
    }

    pub fn run<S: DeviceIo, R: DeviceIo>(
        &self,
        src: &mut VhdImage<S>,
        open_raw: impl FnOnce() -> Result<R>,
        cipher: Option<&SectorCipher>,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let mut cloned = None;
        let result = (|| {
            if let (Some(path), Some(command)) = (&self.clone_to, &self.command) {
                let opts = CloneOptions {
                    quick: true,
                    keep_keyhash: self.keep_keyhash,
                    ..Default::default()
                };
                clone_metadata_with(src, path, &opts)?.close()?;
                cloned = Some(path);
                instantiate_output(command)?;
            }
            let mut raw = open_raw()?;
            dm_encrypt(src, &mut raw, cipher, progress)?;
            raw.close()
        })();

        if result.is_err() {
            if let Some(path) = cloned {
                discard_output(path);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::device::{FileDevice, MemDevice};
    use crate::transform::NoProgress;
    use crate::vhd::CreateOptions;

    fn source() -> VhdImage<MemDevice> {
        let mut src = VhdImage::create_on(
            MemDevice::new(),
            &CreateOptions::dynamic(1 << 20).with_block_size(64 * 1024),
        )
        .unwrap();
        src.write_sectors(300, &[0x11; 1024]).unwrap();
        src
    }

    #[test]
    fn allocated_runs_land_at_logical_offsets() {
        let mut src = source();
        let mut raw = MemDevice::new();
        dm_encrypt(&mut src, &mut raw, None, &mut NoProgress).unwrap();
        let bytes = raw.into_vec();
        assert_eq!(bytes.len(), 302 * 512);
        assert!(bytes[300 * 512..].iter().all(|b| *b == 0x11));
        assert!(bytes[..300 * 512].iter().all(|b| *b == 0));
    }

    #[test]
    fn cipher_output_decrypts_per_logical_sector() {
        let mut src = source();
        let key = Key::new(vec![9; 64]).unwrap();
        let cipher = SectorCipher::new(&key).unwrap();
        let mut raw = MemDevice::new();
        dm_encrypt(&mut src, &mut raw, Some(&cipher), &mut NoProgress).unwrap();

        let mut sector = raw.as_slice()[301 * 512..302 * 512].to_vec();
        assert_ne!(sector, vec![0x11; 512]);
        cipher.decrypt(301, &mut sector).unwrap();
        assert_eq!(sector, vec![0x11; 512]);
    }

    #[test]
    fn failed_command_removes_the_clone() {
        let dir = tempfile::tempdir().unwrap();
        let clone = dir.path().join("new.vhd");
        let job = EncryptJob::new(Some(clone.clone()), Some("exit 3".into())).unwrap();
        let mut src = source();
        let err = job
            .run(
                &mut src,
                || FileDevice::open(dir.path().join("raw"), true),
                None,
                &mut NoProgress,
            )
            .unwrap_err();
        assert!(matches!(err, VhdError::Io(_)));
        assert!(!clone.exists());
    }

    #[test]
    fn command_runs_before_raw_output_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let clone = dir.path().join("new.vhd");
        let raw = dir.path().join("raw");
        let command = format!("echo created; : > '{}'", raw.display());
        let job = EncryptJob::new(Some(clone.clone()), Some(command)).unwrap();
        let mut src = source();
        job.run(&mut src, || FileDevice::open(&raw, true), None, &mut NoProgress)
            .unwrap();
        assert!(clone.exists());
        assert_eq!(std::fs::metadata(&raw).unwrap().len(), 302 * 512);
    }

    #[test]
    fn clone_and_command_go_together() {
        assert!(EncryptJob::new(Some("x.vhd".into()), None).is_err());
        assert!(EncryptJob::new(None, Some("true".into())).is_err());
        assert!(EncryptJob::new(None, None).is_ok());
    }
}
