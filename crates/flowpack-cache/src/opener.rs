//! Output opener (§4.6): turns a cache key into an open `File`, either
//! in repository mode (one locked file per key, reused across restarts)
//! or incremental mode (a fresh placeholder+working pair per key, merged
//! later by the appender).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fs2::FileExt;

use flowpack_config::path::ensure_dir_0755;
use flowpack_model::CacheKey;
use flowpack_wire::{
    self as wire, ByteOrder, CompressionMethod, FileHeader, PackedFileDirective, HEADER_LEN,
};

/// An opened output stream and the path it lives at.
pub struct OpenedFile {
    pub file: File,
    pub filename: PathBuf,
}

/// The cache's hook for turning a miss into an open file. `prior_path`
/// is `Some` when the cache is reopening an entry it had previously
/// closed (eviction or a restart-recovery reopen); implementations
/// should prefer reopening that exact path over recomputing one.
pub trait Opener: Send + Sync {
    fn open(&self, key: CacheKey, prior_path: Option<&Path>) -> anyhow::Result<OpenedFile>;
}

/// Block until an exclusive advisory lock is held, or return once
/// `shutdown` is observed set. Retries on `WouldBlock`; any other error
/// (e.g. `ENOLCK` from a filesystem without lock support) is fatal.
fn acquire_lock_interruptible(file: &File, shutdown: &AtomicBool) -> anyhow::Result<()> {
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if shutdown.load(Ordering::SeqCst) {
                    anyhow::bail!("shutdown observed while waiting for output file lock");
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("advisory lock failed; filesystem may not support flock"));
            }
        }
    }
}

/// Repository-mode opener (§4.6.1): one file per cache key under `root`,
/// named by a site-specific (here: default) naming rule, opened
/// read-write and advisory-locked for the life of the process's hold on
/// it. Existing files are detected by a header-length probe read and
/// appended to; missing files get a fresh header.
pub struct RepositoryOpener {
    pub root: PathBuf,
    pub file_format_id: u16,
    pub byte_order: ByteOrder,
    pub compression: CompressionMethod,
    pub locking: bool,
    pub shutdown: AtomicBool,
}

impl RepositoryOpener {
    pub fn new(root: PathBuf, file_format_id: u16, locking: bool) -> Self {
        Self {
            root,
            file_format_id,
            byte_order: ByteOrder::Native,
            compression: CompressionMethod::None,
            locking,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Opener for RepositoryOpener {
    fn open(&self, key: CacheKey, _prior_path: Option<&Path>) -> anyhow::Result<OpenedFile> {
        let rel = wire::default_repository_relpath(key);
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            ensure_dir_0755(parent)?;
        }

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                {
                    Ok(f) => f,
                    Err(e2) if e2.kind() == io::ErrorKind::AlreadyExists => {
                        OpenOptions::new().read(true).write(true).open(&path)?
                    }
                    Err(e2) => return Err(e2.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        if self.locking {
            acquire_lock_interruptible(&file, &self.shutdown)?;
        }

        let mut probe = [0u8; HEADER_LEN];
        let n = read_up_to(&mut file, &mut probe)?;
        match n {
            HEADER_LEN => {
                file.seek(SeekFrom::End(0))?;
            }
            0 => {
                let header = FileHeader::new(
                    self.file_format_id,
                    self.byte_order,
                    self.compression,
                    PackedFileDirective {
                        hour_ms: key.hour_ms,
                        flowtype_id: key.flowtype_id,
                        sensor_id: key.sensor_id,
                    },
                );
                let bytes = header.to_bytes();
                match bytes {
                    Ok(bytes) => {
                        if let Err(e) = file.write_all(&bytes) {
                            let _ = file.set_len(0);
                            return Err(e.into());
                        }
                    }
                    Err(e) => {
                        let _ = file.set_len(0);
                        return Err(e.into());
                    }
                }
            }
            other => anyhow::bail!("short header read: got {other} of {HEADER_LEN} bytes"),
        }

        Ok(OpenedFile { file, filename: path })
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Incremental-mode opener (§4.6.2): a fresh placeholder+working file
/// pair per cache key, written under `dir`. Reopening a key after
/// eviction reuses the same working path, passed back as `prior_path`.
pub struct IncrementalOpener {
    pub dir: PathBuf,
    pub file_format_id: u16,
    pub byte_order: ByteOrder,
    pub compression: CompressionMethod,
}

impl IncrementalOpener {
    pub fn new(dir: PathBuf, file_format_id: u16) -> Self {
        Self {
            dir,
            file_format_id,
            byte_order: ByteOrder::Native,
            compression: CompressionMethod::None,
        }
    }
}

impl Opener for IncrementalOpener {
    fn open(&self, key: CacheKey, prior_path: Option<&Path>) -> anyhow::Result<OpenedFile> {
        if let Some(path) = prior_path {
            let file = OpenOptions::new().read(true).append(true).open(path)?;
            return Ok(OpenedFile {
                file,
                filename: path.to_path_buf(),
            });
        }

        let basename = wire::default_basename(key);
        let pair = wire::create_incremental_pair(&self.dir, &basename)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pair.working)?;

        let header = FileHeader::new(
            self.file_format_id,
            self.byte_order,
            self.compression,
            PackedFileDirective {
                hour_ms: key.hour_ms,
                flowtype_id: key.flowtype_id,
                sensor_id: key.sensor_id,
            },
        );
        let write_result = header
            .to_bytes()
            .map_err(anyhow::Error::from)
            .and_then(|bytes| file.write_all(&bytes).map_err(anyhow::Error::from));
        if let Err(e) = write_result {
            wire::cleanup_pair(&pair);
            return Err(e);
        }

        Ok(OpenedFile {
            file,
            filename: pair.working,
        })
    }
}
