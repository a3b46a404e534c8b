//! Sidecar lock for snapshot writers.
//!
//! One lock file lives in each snapshot directory. Writers hold it
//! exclusively while a snapshot is written; readers never take it. The lock
//! is released when the guard drops, on every exit path.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Name of the lock file created next to the snapshots.
pub const LOCK_FILE_NAME: &str = ".measync.lock";

/// Retry policy used when the lock is held by another writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Total number of acquisition attempts.
    pub attempts: u32,
    /// Delay after the first failed attempt; doubled after each failure.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock stayed busy for every attempt.
    #[error("Lock {} still held after {attempts} attempts", path.display())]
    Contention { path: PathBuf, attempts: u32 },

    /// The lock file could not be opened.
    #[error("Failed to open lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive hold on a directory's sidecar lock.
#[derive(Debug)]
pub struct SnapshotLock {
    file: File,
    path: PathBuf,
}

impl SnapshotLock {
    /// Path of the lock file guarding `dir`.
    pub fn path_for_dir(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Acquire the lock for `dir`, retrying with exponential backoff.
    ///
    /// The directory must exist.
    pub fn acquire(dir: &Path, policy: &LockPolicy) -> Result<Self, LockError> {
        let path = Self::path_for_dir(dir);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        let attempts = policy.attempts.max(1);
        let mut backoff = policy.initial_backoff;
        for attempt in 1..=attempts {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(e) if is_contended(&e) => {
                    if attempt < attempts {
                        thread::sleep(backoff);
                        backoff = (backoff * 2).min(policy.max_backoff);
                    }
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }

        Err(LockError::Contention { path, attempts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
