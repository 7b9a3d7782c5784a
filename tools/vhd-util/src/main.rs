use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use vhd_storage::chain::{find_keyed_image, ImageChain};
use vhd_storage::crypto::{check_key, Key, KeyDirs, Keystore, KEYDIR_ENV};
use vhd_storage::device::{DeviceIo, FileDevice, StreamDevice};
use vhd_storage::transform::{
    clone_metadata, dm_decrypt, stream_coalesce, CoalesceOptions, EncryptJob, NoProgress,
    Progress,
};
use vhd_storage::{OpenMode, VhdError, VhdImage};

#[derive(Parser, Debug)]
#[command(
    name = "vhd-util",
    version,
    about = "Clone, coalesce, encrypt and decrypt sparse VHD images."
)]
struct Args {
    /// Comma-separated directories searched for image keyfiles
    #[arg(long, global = true, env = KEYDIR_ENV, value_name = "DIRS")]
    key_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty image carrying the metadata of another
    CloneMetadata {
        /// Image to copy metadata from ('-' for stdin)
        #[arg(short = 'i', value_name = "NAME")]
        input: PathBuf,

        /// Image to create
        #[arg(short = 'o', value_name = "NAME")]
        output: PathBuf,

        /// Reuse the footer the input was opened with instead of re-reading it
        #[arg(short = 'q', action = clap::ArgAction::SetTrue)]
        quick: bool,
    },

    /// Rebuild an image from its metadata and the plaintext view of its data
    DmDecrypt {
        /// Device or file holding the data, addressed by virtual offset
        #[arg(short = 'i', value_name = "NAME")]
        raw_in: PathBuf,

        /// Image whose metadata describes the data
        #[arg(short = 'I', value_name = "NAME")]
        vhd_in: PathBuf,

        /// Image to create ('-' for stdout)
        #[arg(short = 'o', value_name = "NAME")]
        output: PathBuf,

        /// Display progress
        #[arg(short = 'p', action = clap::ArgAction::SetTrue)]
        progress: bool,
    },

    /// Write the allocated data of an image to a device at virtual offsets
    DmEncrypt {
        /// Image to read ('-' for stdin)
        #[arg(short = 'i', value_name = "NAME")]
        input: PathBuf,

        /// Device or file receiving the data
        #[arg(short = 'o', value_name = "NAME")]
        raw_out: PathBuf,

        /// Image to create with the metadata of the input before writing
        #[arg(short = 'c', value_name = "NAME", requires = "command")]
        clone_to: Option<PathBuf>,

        /// Shell command that instantiates the cloned image as the output device
        #[arg(short = 'C', value_name = "COMMAND", requires = "clone_to")]
        command: Option<String>,

        /// Copy the input keyhash into the cloned image
        #[arg(short = 'K', requires = "clone_to", action = clap::ArgAction::SetTrue)]
        keep_keyhash: bool,

        /// Display progress
        #[arg(short = 'p', action = clap::ArgAction::SetTrue)]
        progress: bool,
    },

    /// Coalesce a chain of images, youngest first, into one new image
    StreamCoalesce {
        /// Image to create
        #[arg(short = 'o', value_name = "NAME", required_unless_present = "info")]
        output: Option<PathBuf>,

        /// Continue even if the inputs do not form a chain
        #[arg(short = 'D', action = clap::ArgAction::SetTrue)]
        ignore_order: bool,

        /// Display progress
        #[arg(short = 'p', action = clap::ArgAction::SetTrue)]
        progress: bool,

        /// Print the headers of each input and exit
        #[arg(short = 'i', action = clap::ArgAction::SetTrue)]
        info: bool,

        /// Print header fields in hex
        #[arg(short = 'x', action = clap::ArgAction::SetTrue)]
        hex: bool,

        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Set, check or print the keyhash of an image
    #[command(group(ArgGroup::new("action").required(true).args(["set", "check", "print"])))]
    Key {
        #[arg(short = 'n', value_name = "NAME")]
        name: PathBuf,

        /// Keyfile to record with -s
        #[arg(short = 'k', value_name = "KEYFILE", requires = "set")]
        keyfile: Option<PathBuf>,

        /// Record a fresh keyhash for the -k keyfile
        #[arg(short = 's', action = clap::ArgAction::SetTrue, requires = "keyfile")]
        set: bool,

        /// Verify a keyfile against the recorded keyhash
        #[arg(short = 'C', value_name = "KEYFILE")]
        check: Option<PathBuf>,

        /// Print the recorded keyhash
        #[arg(short = 'p', action = clap::ArgAction::SetTrue)]
        print: bool,
    },

    /// Print the headers of an image and describe its chain
    Info {
        name: PathBuf,

        /// Print header fields in hex
        #[arg(short = 'x', action = clap::ArgAction::SetTrue)]
        hex: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(libc::EINVAL as u8),
            };
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("vhd-util: {err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}

/// Exit status for a failed command: the errno of the first typed error in the chain.
fn exit_status(err: &anyhow::Error) -> u8 {
    let errno = err
        .chain()
        .find_map(|e| {
            e.downcast_ref::<VhdError>()
                .map(VhdError::errno)
                .or_else(|| e.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error))
        })
        .unwrap_or(libc::EIO);
    u8::try_from(errno).unwrap_or(1)
}

fn run(args: Args) -> Result<()> {
    let key_dirs = args.key_dir.as_deref().map(KeyDirs::parse);
    match args.command {
        Command::CloneMetadata {
            input,
            output,
            quick,
        } => {
            if is_stdio(&input) {
                clone_from(load_stream(&input)?, &output, quick)
            } else {
                let src = VhdImage::open_path(&input, OpenMode::ReadOnly)
                    .with_context(|| format!("failed to open {}", input.display()))?;
                clone_from(src, &output, quick)
            }
        }
        Command::DmDecrypt {
            raw_in,
            vhd_in,
            output,
            progress,
        } => decrypt(&raw_in, &vhd_in, &output, progress_sink(progress).as_mut()),
        Command::DmEncrypt {
            input,
            raw_out,
            clone_to,
            command,
            keep_keyhash,
            progress,
        } => {
            let job = EncryptJob::new(clone_to, command)?.with_keyhash(keep_keyhash);
            let mut src = load_stream(&input)?;
            job.run(
                &mut src,
                || FileDevice::open(&raw_out, true),
                None,
                progress_sink(progress).as_mut(),
            )
            .with_context(|| format!("failed to write {}", raw_out.display()))?;

            // A writer feeding a pipe blocks until everything it sent has been read.
            if is_stdio(&input) || is_fifo(&input) {
                let n = src.device_mut().drain()?;
                tracing::debug!(bytes = n, "drained input");
            }
            src.close()?;
            Ok(())
        }
        Command::StreamCoalesce {
            output,
            ignore_order,
            progress,
            info,
            hex,
            files,
        } => {
            let mut images = files
                .iter()
                .map(|f| load_stream(f))
                .collect::<Result<Vec<_>>>()?;

            if info {
                let text: Vec<String> = images.iter().map(|i| i.print_headers(hex)).collect();
                println!("{}", text.join("\n\n"));
                return Ok(());
            }

            let Some(output) = output else {
                anyhow::bail!(VhdError::InvalidArgument("an output image is required".into()));
            };
            stream_coalesce(
                &mut images,
                &output,
                CoalesceOptions { ignore_order },
                progress_sink(progress).as_mut(),
            )
            .with_context(|| format!("failed to coalesce into {}", output.display()))?;
            for img in images {
                img.close()?;
            }
            Ok(())
        }
        Command::Key {
            name,
            keyfile,
            set,
            check,
            print,
        } => {
            if print {
                let img = VhdImage::open_path(&name, OpenMode::ReadOnly)
                    .with_context(|| format!("failed to open {}", name.display()))?;
                let kh = img.keyhash();
                if kh.is_present() {
                    println!("{}", kh.hash_hex());
                } else {
                    println!("none");
                }
                img.close()?;
            } else if let Some(path) = check {
                let img = VhdImage::open_path(&name, OpenMode::ReadOnly)
                    .with_context(|| format!("failed to open {}", name.display()))?;
                let key = read_keyfile(&path)?;
                check_key(&key, &img.keyhash())
                    .with_context(|| format!("{} does not unlock {}", path.display(), name.display()))?;
                img.close()?;
            } else if let (true, Some(path)) = (set, keyfile) {
                let mut img = VhdImage::open_path(&name, OpenMode::ReadWrite)
                    .with_context(|| format!("failed to open {}", name.display()))?;
                let key = read_keyfile(&path)?;
                let kh = img.set_key(&key)?;
                println!("{}", kh.hash_hex());
                img.close()?;
            }
            Ok(())
        }
        Command::Info { name, hex } => {
            let mut leaf = VhdImage::open_path(&name, OpenMode::ReadOnly)
                .with_context(|| format!("failed to open {}", name.display()))?;
            println!("{}", leaf.print_headers(hex));

            if let Some(dirs) = &key_dirs {
                let mut keystore = Keystore::new();
                match find_keyed_image(&mut leaf, Some(dirs), &mut keystore)? {
                    Some(found) => {
                        println!("Key                 : {}-bit, from {}", found.key.bits(), found.image)
                    }
                    None => println!("Key                 : none"),
                }
            }

            let chain = ImageChain::open(leaf)
                .with_context(|| format!("failed to resolve the chain of {}", name.display()))?;
            println!("Chain depth         : {}", chain.depth());
            for parent in chain.ancestors() {
                println!("  {} ({})", parent.name(), parent.uuid());
            }
            Ok(())
        }
    }
}

fn clone_from<D: DeviceIo>(mut src: VhdImage<D>, output: &Path, quick: bool) -> Result<()> {
    clone_metadata(&mut src, output, quick)
        .with_context(|| format!("failed to create {}", output.display()))?
        .close()?;
    src.close()?;
    Ok(())
}

fn decrypt(raw_in: &Path, vhd_in: &Path, output: &Path, progress: &mut dyn Progress) -> Result<()> {
    let mut raw = FileDevice::open(raw_in, false)
        .with_context(|| format!("failed to open {}", raw_in.display()))?;
    let mut src = VhdImage::open_path(vhd_in, OpenMode::ReadOnly)
        .with_context(|| format!("failed to open {}", vhd_in.display()))?;

    if is_stdio(output) {
        dm_decrypt(&mut raw, &mut src, StreamDevice::stdout(), None, progress)?.close()?;
    } else {
        let dst = FileDevice::create_new(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        let written = dm_decrypt(&mut raw, &mut src, dst, None, progress).and_then(|img| img.close());
        if let Err(err) = written {
            if let Err(e) = fs::remove_file(output) {
                tracing::warn!(path = %output.display(), error = %e, "failed to remove partial output");
            }
            return Err(err).with_context(|| format!("failed to write {}", output.display()));
        }
    }

    src.close()?;
    raw.close()?;
    Ok(())
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

#[cfg(unix)]
fn is_fifo(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path).is_ok_and(|m| m.file_type().is_fifo())
}

#[cfg(not(unix))]
fn is_fifo(_path: &Path) -> bool {
    false
}

/// Opens an image as a forward-only stream. `-` reads standard input.
fn load_stream(input: &Path) -> Result<VhdImage<StreamDevice>> {
    let dev = if is_stdio(input) {
        StreamDevice::stdin()
    } else {
        let file =
            File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
        StreamDevice::reader(BufReader::new(file))
    };
    let mut img =
        VhdImage::open(dev).with_context(|| format!("failed to load {}", input.display()))?;
    if !is_stdio(input) {
        img.set_path(input);
    }
    Ok(img)
}

fn read_keyfile(path: &Path) -> Result<Key> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Key::new(bytes).with_context(|| format!("{} is not a usable key", path.display()))
}

fn progress_sink(enabled: bool) -> Box<dyn Progress> {
    if enabled {
        Box::new(BarProgress::default())
    } else {
        Box::new(NoProgress)
    }
}

/// Renders transform progress on stderr.
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl Progress for BarProgress {
    fn begin(&mut self, total: u64) {
        let bar = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {pos}/{len} blocks")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        self.bar = Some(bar);
    }

    fn advance(&mut self, n: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(n);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}
