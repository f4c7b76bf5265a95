//! Compression backends.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Turns a closed container into its compressed form.
///
/// Implementations write `output` and must not delete `input`; the caller
/// decides what happens to the input once compression has succeeded.
#[async_trait]
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    async fn compress(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs an external gzip-compatible program (`pigz`, `gzip`) as
/// `<program> -c <input>` with stdout redirected to `<output>`, so the input
/// stays in place until the caller removes it.
#[derive(Debug, Clone)]
pub struct ProcessCompressor {
    program: String,
}

impl ProcessCompressor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn pigz() -> Self {
        Self::new("pigz")
    }

    pub fn gzip() -> Self {
        Self::new("gzip")
    }
}

#[async_trait]
impl Compressor for ProcessCompressor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let out = File::create(output)?;

        debug!("Running {} -c {}", self.program, input.display());
        let child = Command::new(&self.program)
            .arg("-c")
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::Compression(format!("cannot run {}: {}", self.program, e)))?;

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::Compression(format!("{} failed: {}", self.program, e)))?;

        if !result.status.success() {
            return Err(BackupError::Compression(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        Ok(())
    }
}

/// In-process gzip, for hosts without `pigz`.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

#[async_trait]
impl Compressor for GzipCompressor {
    fn name(&self) -> &str {
        "builtin-gzip"
    }

    async fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let input: PathBuf = input.to_path_buf();
        let output: PathBuf = output.to_path_buf();
        let level = Compression::new(self.level);

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            let mut encoder = GzEncoder::new(writer, level);
            std::io::copy(&mut reader, &mut encoder)?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
            writer.get_ref().sync_all()
        })
        .await
        .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))?
        .map_err(|e| BackupError::Compression(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_builtin_gzip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("vm1.tar");
        let output = dir.path().join("vm1.tar.gz");
        std::fs::write(&input, b"domain archive contents").unwrap();

        GzipCompressor::default()
            .compress(&input, &output)
            .await
            .unwrap();

        let mut decoded = String::new();
        GzDecoder::new(File::open(&output).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "domain archive contents");
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_builtin_gzip_missing_input() {
        let dir = TempDir::new().unwrap();
        let err = GzipCompressor::default()
            .compress(&dir.path().join("missing.tar"), &dir.path().join("missing.tar.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Compression(_)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("vm1.tar");
        std::fs::write(&input, b"x").unwrap();

        let err = ProcessCompressor::new("kvm-backup-no-such-compressor")
            .compress(&input, &dir.path().join("vm1.tar.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Compression(_)));
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_process_compressor_writes_output_and_keeps_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("vm1.tar");
        let output = dir.path().join("vm1.tar.gz");
        std::fs::write(&input, b"domain archive contents").unwrap();

        match ProcessCompressor::gzip().compress(&input, &output).await {
            Err(BackupError::Compression(msg)) if msg.starts_with("cannot run") => return,
            other => other.unwrap(),
        }

        let mut decoded = String::new();
        GzDecoder::new(File::open(&output).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "domain archive contents");
        assert!(input.exists());
    }

    #[test]
    fn test_level_clamped() {
        assert_eq!(GzipCompressor::new(42).level, 9);
        assert_eq!(ProcessCompressor::pigz().name(), "pigz");
    }
}
