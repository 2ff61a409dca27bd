//! Cross-process lock on a target document.
//!
//! A run holds a [`TargetLock`] from the moment it reads the target until
//! the write has been verified, so two invocations can never interleave
//! their read-backup-write sequences on the same file.
//!
//! The lock is an advisory OS lock on `<target>.lock`. The lock file itself
//! is left in place after release; only the OS lock carries meaning.

use std::fs::{File, OpenOptions};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from acquiring a target lock.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock.
    #[error("{target} is being modified by another process (lock: {lock_path}{holder})")]
    Busy {
        /// Locked document.
        target: Utf8PathBuf,
        /// Lock file path.
        lock_path: Utf8PathBuf,
        /// `", pid N"` when the holder recorded its pid.
        holder: String,
    },

    /// The lock file could not be created or locked.
    #[error("failed to lock {lock_path}: {source}")]
    Io {
        /// Lock file path.
        lock_path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Exclusive hold on a target document; released on drop.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: Utf8PathBuf,
}

impl TargetLock {
    /// Take the lock for `target` without waiting.
    pub fn acquire(target: &Utf8Path) -> LockResult<Self> {
        let path = lock_path_for(target);
        let io_err = |source: std::io::Error| LockError::Io {
            lock_path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .map(|pid| format!(", pid {pid}"))
                    .unwrap_or_default();
                return Err(LockError::Busy {
                    target: target.to_path_buf(),
                    lock_path: path,
                    holder,
                });
            }
            return Err(io_err(e));
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(&file, "{}", std::process::id()).map_err(io_err)?;
        debug!(lock = %path, "target locked");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path, error = %e, "failed to release target lock");
        }
    }
}

/// `<target>.lock`, beside the target.
pub fn lock_path_for(target: &Utf8Path) -> Utf8PathBuf {
    let mut name = target.file_name().unwrap_or("target").to_owned();
    name.push_str(".lock");
    target.with_file_name(name)
}
