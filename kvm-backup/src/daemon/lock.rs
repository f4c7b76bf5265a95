//! Host-wide instance lock.
//!
//! An exclusive `flock(2)` on a well-known file. The kernel drops the lock
//! when the holding process exits, however it exits, so a stale lock file on
//! disk never blocks the next run.

use crate::utils::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory holding lock files
pub const LOCK_DIR: &str = "/var/run";

/// Held instance lock. Dropping it releases the lock.
pub struct InstanceLock {
    path: PathBuf,
    lock: Flock<File>,
}

impl InstanceLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another holder has it and `blocking` is false.
    /// With `blocking` set, waits for as long as the current holder keeps it.
    pub fn acquire(path: &Path, blocking: bool) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| BackupError::Lock(format!("cannot open {}: {}", path.display(), e)))?;

        let arg = if blocking {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockExclusiveNonblock
        };

        let lock = match Flock::lock(file, arg) {
            Ok(lock) => lock,
            Err((_file, Errno::EWOULDBLOCK)) => {
                debug!("Lock {} is held by another process", path.display());
                return Ok(None);
            }
            Err((_file, e)) => {
                return Err(BackupError::Lock(format!(
                    "cannot lock {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        // pid is informational only
        let mut holder: &File = &lock;
        holder.set_len(0)?;
        writeln!(holder, "{}", std::process::id())?;

        info!("Acquired instance lock {}", path.display());
        Ok(Some(Self {
            path: path.to_path_buf(),
            lock,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly.
    pub fn release(self) -> Result<()> {
        let path = self.path;
        self.lock
            .unlock()
            .map_err(|(_, e)| BackupError::Lock(format!("cannot unlock {}: {}", path.display(), e)))?;
        debug!("Released instance lock {}", path.display());
        Ok(())
    }
}

/// Lock file path for a program: `/var/run/<program stem>.lock`.
pub fn default_lock_path(program: &str) -> PathBuf {
    let stem = Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    Path::new(LOCK_DIR).join(format!("{}.lock", stem))
}
