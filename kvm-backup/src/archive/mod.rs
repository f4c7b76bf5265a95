//! Archive files of a domain: rotation, the uncompressed container and the
//! compression handoff.
//!
//! Layout inside a domain's working directory:
//!
//! | File                 | Meaning                                  |
//! |----------------------|------------------------------------------|
//! | `<domain>.tar`       | container being written by the current run |
//! | `<domain>.tar.gz`    | latest compressed archive                |
//! | `<domain>.tar.gz.N`  | N-th older archive, `1` is the newest    |

pub mod compress;
pub mod container;

pub use compress::{Compressor, GzipCompressor, ProcessCompressor};
pub use container::ArchiveContainer;

use crate::utils::{BackupError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extension appended by compression
pub const COMPRESSED_EXT: &str = "gz";

/// Rotates archives and hands closed containers to a compressor.
pub struct ArchiveManager {
    compressor: Box<dyn Compressor>,
}

impl ArchiveManager {
    pub fn new(compressor: Box<dyn Compressor>) -> Self {
        Self { compressor }
    }

    pub fn compressor_name(&self) -> &str {
        self.compressor.name()
    }

    /// Shift `path` to `path.1`, `path.1` to `path.2`, and so on.
    ///
    /// Siblings that would end up with an index above `count` are deleted,
    /// including leftovers from a larger retention setting. With `count == 0`
    /// the current archive itself is deleted. No-op when `path` is missing.
    pub fn rotate(&self, path: &Path, count: u32) -> Result<()> {
        rotate(path, count)
    }

    /// Compress `path` into `path.gz` and remove `path`.
    ///
    /// On failure `path` is left untouched and any partial output is removed.
    pub async fn compress(&self, path: &Path) -> Result<PathBuf> {
        let output = with_suffix(path, COMPRESSED_EXT);
        if output.exists() {
            return Err(BackupError::Compression(format!(
                "{} already exists",
                output.display()
            )));
        }

        info!(
            "Compressing {} with {}",
            path.display(),
            self.compressor.name()
        );

        if let Err(e) = self.compressor.compress(path, &output).await {
            if output.exists() {
                if let Err(rm) = std::fs::remove_file(&output) {
                    warn!("Failed to remove partial {}: {}", output.display(), rm);
                }
            }
            return Err(e);
        }

        if !output.is_file() {
            return Err(BackupError::Compression(format!(
                "{} reported success but {} is missing",
                self.compressor.name(),
                output.display()
            )));
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }
        debug!("Compressed archive written to {}", output.display());
        Ok(output)
    }
}

/// See [`ArchiveManager::rotate`].
pub fn rotate(path: &Path, count: u32) -> Result<()> {
    if !path.is_file() {
        return Ok(());
    }

    let mut kept = Vec::new();
    for (index, sibling) in numbered_siblings(path)? {
        if index >= count {
            debug!("Discarding {}", sibling.display());
            std::fs::remove_file(&sibling)?;
        } else {
            kept.push((index, sibling));
        }
    }

    // highest index first so no rename overwrites a file still to be shifted
    kept.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (index, from) in kept {
        let to = numbered(path, index + 1);
        debug!("Renaming {} to {}", from.display(), to.display());
        std::fs::rename(&from, &to)?;
    }

    if count == 0 {
        debug!("Retention is 0, discarding {}", path.display());
        std::fs::remove_file(path)?;
    } else {
        let to = numbered(path, 1);
        debug!("Renaming {} to {}", path.display(), to.display());
        std::fs::rename(path, &to)?;
    }

    Ok(())
}

/// `path.N`
pub fn numbered(path: &Path, index: u32) -> PathBuf {
    with_suffix(path, &index.to_string())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Existing `path.N` files with N >= 1, in no particular order.
fn numbered_siblings(path: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", base);

    let mut siblings = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<u32>().ok())
        else {
            continue;
        };
        if index >= 1 && entry.file_type()?.is_file() {
            siblings.push((index, entry.path()));
        }
    }
    Ok(siblings)
}
