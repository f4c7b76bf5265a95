//! Uncompressed tar container written during a run.

use crate::utils::{BackupError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::debug;

/// A tar file open for appending.
///
/// Appends run on the blocking pool since disk images can be large.
pub struct ArchiveContainer {
    path: PathBuf,
    builder: Option<Builder<File>>,
    entries: usize,
}

impl ArchiveContainer {
    /// Create an empty container at `path`, truncating any leftover file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        debug!("Opened archive container {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            builder: Some(Builder::new(file)),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Append the file at `source` under the entry name `name`.
    pub async fn append_file(&mut self, source: &Path, name: &str) -> Result<()> {
        let mut builder = self.builder.take().ok_or_else(|| closed(&self.path))?;
        let source = source.to_path_buf();
        let name = name.to_string();

        let builder = tokio::task::spawn_blocking(move || -> std::io::Result<Builder<File>> {
            builder.append_path_with_name(&source, &name)?;
            Ok(builder)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        self.builder = Some(builder);
        self.entries += 1;
        Ok(())
    }

    /// Write the tar trailer and flush the file to disk.
    pub async fn close(mut self) -> Result<PathBuf> {
        let builder = self.builder.take().ok_or_else(|| closed(&self.path))?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = builder.into_inner()?;
            file.sync_all()
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        debug!(
            "Closed archive container {} ({} entries)",
            self.path.display(),
            self.entries
        );
        Ok(self.path)
    }
}

fn closed(path: &Path) -> BackupError {
    BackupError::Io(std::io::Error::other(format!(
        "archive container {} is no longer writable",
        path.display()
    )))
}
