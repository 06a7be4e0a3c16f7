//! Advisory exclusive lock over a queue directory.
//!
//! Only cooperating consumers check the lock. Producers never take it: they
//! publish items with an atomic rename and need no coordination.
//!
//! On Unix the lock is `flock(2)` on an open handle to the directory itself.
//! Elsewhere directories cannot be opened as files, so a sentinel file inside
//! the directory carries the lock instead.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Name of the sentinel file used where directories cannot be locked directly.
pub const SENTINEL_FILE: &str = ".dirq.lock";

/// Who may consume a queue directory right now.
///
/// Acquisition never blocks: a lock held elsewhere reports `false` so the
/// caller can back off on its own schedule.
pub trait DirectoryLock: Send + Sync {
    /// Attempts to take the lock without waiting.
    ///
    /// Returns `Ok(true)` if the lock is now held by this handle (including
    /// when it already was), `Ok(false)` if another holder has it.
    fn try_acquire(&mut self) -> io::Result<bool>;

    /// Releases the lock if held. Idempotent.
    fn release(&mut self) -> io::Result<()>;

    /// Whether this handle currently holds the lock.
    fn is_held(&self) -> bool;
}

/// OS advisory lock backed by `fs2`.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: Option<File>,
}

impl FileLock {
    /// Creates an unheld lock for a queue directory.
    pub fn for_dir(dir: &Path) -> Self {
        FileLock {
            path: lock_target(dir),
            held: None,
        }
    }

    /// The path whose handle carries the lock.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn lock_target(dir: &Path) -> PathBuf {
    dir.to_path_buf()
}

#[cfg(not(unix))]
fn lock_target(dir: &Path) -> PathBuf {
    dir.join(SENTINEL_FILE)
}

#[cfg(unix)]
fn open_target(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(not(unix))]
fn open_target(path: &Path) -> io::Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl DirectoryLock for FileLock {
    fn try_acquire(&mut self) -> io::Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }

        let file = open_target(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.held = Some(file);
                Ok(true)
            }
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn release(&mut self) -> io::Result<()> {
        match self.held.take() {
            Some(file) => FileExt::unlock(&file),
            None => Ok(()),
        }
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }
}
