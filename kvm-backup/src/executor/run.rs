//! The per-domain backup pipeline.

use super::state::{read_journal, RunState, StateMachine, JOURNAL_FILE};
use crate::archive::{ArchiveContainer, ArchiveManager, COMPRESSED_EXT};
use crate::hypervisor::SnapshotService;
use crate::utils::{BackupError, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One backup of one domain on one day.
pub struct BackupRun {
    domain: String,
    rotate: u32,
    date: NaiveDate,
    workdir: PathBuf,
    staging: PathBuf,
    archive_path: PathBuf,
    descriptor_files: Vec<PathBuf>,
    disks: BTreeMap<String, PathBuf>,
    machine: StateMachine,
}

impl BackupRun {
    pub fn new(run_id: Uuid, backupdir: &Path, domain: &str, rotate: u32, date: NaiveDate) -> Self {
        let workdir = backupdir.join(domain);
        let staging = workdir.join(date.format("%Y-%m-%d").to_string());
        let archive_path = workdir.join(format!("{}.tar", domain));

        Self {
            domain: domain.to_string(),
            rotate,
            date,
            workdir,
            staging,
            archive_path,
            descriptor_files: Vec::new(),
            disks: BTreeMap::new(),
            machine: StateMachine::new(run_id, domain, date),
        }
    }

    pub fn state(&self) -> &RunState {
        self.machine.state()
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// `<workdir>/<domain>.tar.gz`
    pub fn compressed_path(&self) -> PathBuf {
        self.workdir
            .join(format!("{}.tar.{}", self.domain, COMPRESSED_EXT))
    }

    pub fn descriptor_files(&self) -> &[PathBuf] {
        &self.descriptor_files
    }

    pub fn disks(&self) -> &BTreeMap<String, PathBuf> {
        &self.disks
    }

    /// Run every step; on failure the state moves to Aborted and residue stays.
    pub async fn execute(
        &mut self,
        snapshot: &mut dyn SnapshotService,
        archives: &ArchiveManager,
    ) -> Result<PathBuf> {
        match self.pipeline(snapshot, archives).await {
            Ok(output) => Ok(output),
            Err(e) => {
                self.record_abort(&e);
                Err(e)
            }
        }
    }

    async fn pipeline(
        &mut self,
        snapshot: &mut dyn SnapshotService,
        archives: &ArchiveManager,
    ) -> Result<PathBuf> {
        self.prepare_directories()?;
        self.rotate_previous(archives)?;

        let mut container = ArchiveContainer::create(&self.archive_path)?;

        self.capture_descriptor(snapshot, &mut container).await?;

        info!("Creating snapshot of {}", self.domain);
        snapshot.create_snapshot().await?;
        self.machine.advance(RunState::SnapshotTaken)?;

        self.copy_disks(snapshot, &mut container).await?;

        info!("Committing snapshot of {}", self.domain);
        snapshot.commit_snapshot().await?;
        self.machine.advance(RunState::Committed)?;

        container.close().await?;
        self.machine.advance(RunState::ArchiveClosed)?;

        let output = archives.compress(&self.archive_path).await?;
        self.machine.advance(RunState::Compressed)?;

        self.clean()?;
        self.machine.advance(RunState::Done)?;

        info!("Backup for {} completed", self.domain);
        Ok(output)
    }

    fn prepare_directories(&mut self) -> Result<()> {
        if !self.workdir.is_dir() {
            info!("Creating directory {}", self.workdir.display());
            std::fs::create_dir_all(&self.workdir)?;
        }

        debug!("Creating directory {}", self.staging.display());
        if let Err(e) = std::fs::create_dir(&self.staging) {
            if e.kind() != ErrorKind::AlreadyExists {
                return Err(e.into());
            }
            let previous = read_journal(&self.staging)
                .map(|record| format!(" (left by run {}: {})", record.run_id, record.state))
                .unwrap_or_default();
            return Err(BackupError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!(
                    "staging directory {} already exists{}",
                    self.staging.display(),
                    previous
                ),
            )));
        }

        self.machine.advance(RunState::DirectoryPrepared)?;
        self.machine.attach_journal(&self.staging)
    }

    fn rotate_previous(&mut self, archives: &ArchiveManager) -> Result<()> {
        let current = self.compressed_path();
        if current.is_file() {
            info!("Rotating backup files for {}", self.domain);
            archives.rotate(&current, self.rotate)?;
        }
        self.machine.advance(RunState::Rotated)
    }

    async fn capture_descriptor(
        &mut self,
        snapshot: &mut dyn SnapshotService,
        container: &mut ArchiveContainer,
    ) -> Result<()> {
        let files = snapshot.export_descriptor(&self.staging).await?;
        info!(
            "Adding descriptor files for {} to archive {}",
            self.domain,
            self.archive_path.display()
        );

        for file in &files {
            let name = self.entry_name(file)?;
            container.append_file(file, &name).await?;
            debug!("{} added", file.display());

            debug!("Removing {} from {}", file.display(), self.staging.display());
            std::fs::remove_file(file)?;
        }

        self.descriptor_files = files;
        self.machine.advance(RunState::DescriptorCaptured)
    }

    async fn copy_disks(
        &mut self,
        snapshot: &mut dyn SnapshotService,
        container: &mut ArchiveContainer,
    ) -> Result<()> {
        let disks = snapshot.disks()?;
        info!(
            "Adding {} image files for {} to archive {}",
            disks.len(),
            self.domain,
            self.archive_path.display()
        );

        let mut used = HashSet::new();
        for (device, source) in &disks {
            let base = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BackupError::Snapshot(format!("{} has no file name", source.display()))
                })?;
            // two disks may share a base name in different directories
            let file_name = if used.insert(base.clone()) {
                base
            } else {
                format!("{}-{}", device, base)
            };
            let dest = self.staging.join(&file_name);

            debug!("Copying {} to {}", source.display(), dest.display());
            let copied = copy_image(source, &dest).await?;
            debug!("{} bytes copied from {}", copied, source.display());

            debug!("Adding {} to archive", dest.display());
            container.append_file(&dest, &self.dated(&file_name)).await?;

            debug!("Removing {} from {}", dest.display(), self.staging.display());
            tokio::fs::remove_file(&dest).await?;
        }

        self.disks = disks;
        self.machine.advance(RunState::DisksCopied)
    }

    fn clean(&mut self) -> Result<()> {
        let mut leftovers = Vec::new();
        for entry in std::fs::read_dir(&self.staging)? {
            let entry = entry?;
            if entry.file_name() != JOURNAL_FILE {
                leftovers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if !leftovers.is_empty() {
            return Err(BackupError::Io(std::io::Error::other(format!(
                "staging directory {} is not empty: {}",
                self.staging.display(),
                leftovers.join(", ")
            ))));
        }

        self.machine.detach_journal()?;
        debug!("Removing directory {}", self.staging.display());
        if let Err(e) = std::fs::remove_dir(&self.staging) {
            // the directory is still there, keep journaling into it
            self.machine.attach_journal(&self.staging)?;
            return Err(e.into());
        }
        self.machine.advance(RunState::Cleaned)
    }

    fn entry_name(&self, file: &Path) -> Result<String> {
        let name = file
            .file_name()
            .ok_or_else(|| BackupError::Snapshot(format!("{} has no file name", file.display())))?;
        Ok(self.dated(&name.to_string_lossy()))
    }

    /// Entry name inside the archive: `<YYYY-MM-DD>/<name>`
    fn dated(&self, name: &str) -> String {
        format!("{}/{}", self.date.format("%Y-%m-%d"), name)
    }

    fn record_abort(&mut self, err: &BackupError) {
        let last = self.machine.state().clone();
        if last.is_terminal() {
            return;
        }
        if let Err(e) = self.machine.abort(err) {
            warn!("Failed to journal aborted run of {}: {}", self.domain, e);
        }

        error!(
            "Backup of {} aborted after {}: {}",
            self.domain, last, err
        );
        if last.overlay_attached() {
            warn!(
                "Snapshot overlay is still attached to {}; commit it manually before the next run",
                self.domain
            );
        }
    }
}

/// Stream a disk image into `dest`. Block devices are read like files.
async fn copy_image(source: &Path, dest: &Path) -> Result<u64> {
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(dest).await?;
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Compressor, GzipCompressor};
    use crate::hypervisor::{Hypervisor, MockFailure, MockHypervisor};
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    struct FailingCompressor;

    #[async_trait]
    impl Compressor for FailingCompressor {
        fn name(&self) -> &str {
            "failing"
        }

        async fn compress(&self, _input: &Path, _output: &Path) -> Result<()> {
            Err(BackupError::Compression("pigz exited with 1".into()))
        }
    }

    /// Compresses normally but leaves an extra file behind in `stray`.
    struct LitteringCompressor {
        stray: PathBuf,
    }

    #[async_trait]
    impl Compressor for LitteringCompressor {
        fn name(&self) -> &str {
            "littering"
        }

        async fn compress(&self, input: &Path, output: &Path) -> Result<()> {
            fs::write(&self.stray, b"leftover")?;
            GzipCompressor::default().compress(input, output).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        backupdir: PathBuf,
        mock: MockHypervisor,
        archives: ArchiveManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        let backupdir = dir.path().join("backup");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&backupdir).unwrap();

        let vda = images.join("vm1.qcow2");
        let vdb = images.join("vm1-data.qcow2");
        fs::write(&vda, vec![7u8; 8192]).unwrap();
        fs::write(&vdb, vec![9u8; 1024]).unwrap();

        let mock = MockHypervisor::new();
        mock.add_domain(
            "vm1",
            BTreeMap::from([("vda".to_string(), vda), ("vdb".to_string(), vdb)]),
        );

        Fixture {
            _dir: dir,
            backupdir,
            mock,
            archives: ArchiveManager::new(Box::new(GzipCompressor::default())),
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run() {
        let f = fixture();
        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");

        let output = run.execute(service.as_mut(), &f.archives).await.unwrap();

        assert_eq!(output, f.backupdir.join("vm1/vm1.tar.gz"));
        assert!(output.is_file());
        assert!(!f.backupdir.join("vm1/vm1.tar").exists());
        assert!(!run.staging_dir().exists());
        assert_eq!(run.state(), &RunState::Done);
        assert_eq!(run.disks().len(), 2);
        assert_eq!(run.descriptor_files().len(), 1);
        assert!(!f.mock.snapshot_active("vm1"));
    }

    #[tokio::test]
    async fn test_archive_contents() {
        use flate2::read::GzDecoder;

        let f = fixture();
        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let output = run.execute(service.as_mut(), &f.archives).await.unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(output).unwrap()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "2024-01-01/vm1-data.qcow2".to_string(),
                "2024-01-01/vm1.qcow2".to_string(),
                "2024-01-01/vm1.xml".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_staging_directory_is_fatal() {
        let f = fixture();
        let staging = f.backupdir.join("vm1/2024-01-01");
        fs::create_dir_all(&staging).unwrap();

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &f.archives).await.unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert!(f.mock.calls_for("vm1").is_empty());
        assert!(matches!(run.state(), RunState::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_existing_staging_reports_previous_state() {
        let f = fixture();
        f.mock.fail_at("vm1", MockFailure::CommitSnapshot);

        let mut first = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        assert!(first.execute(service.as_mut(), &f.archives).await.is_err());

        let mut second = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let err = second
            .execute(service.as_mut(), &f.archives)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("aborted after disks_copied"));
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_rotation() {
        let f = fixture();
        let workdir = f.backupdir.join("vm1");
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("vm1.tar.gz"), b"previous").unwrap();
        f.mock.fail_at("vm1", MockFailure::CreateSnapshot);

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &f.archives).await.unwrap_err();

        assert!(matches!(err, BackupError::Snapshot(_)));
        assert!(!workdir.join("vm1.tar.gz").exists());
        assert_eq!(fs::read(workdir.join("vm1.tar.gz.1")).unwrap(), b"previous");

        let record = read_journal(run.staging_dir()).unwrap();
        assert_eq!(
            record.state,
            RunState::Aborted {
                after: Box::new(RunState::DescriptorCaptured),
                error: err.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_overlay() {
        let f = fixture();
        f.mock.fail_at("vm1", MockFailure::CommitSnapshot);

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        assert!(run.execute(service.as_mut(), &f.archives).await.is_err());

        assert!(f.mock.snapshot_active("vm1"));
        assert!(run.state().overlay_attached());
        assert!(run.staging_dir().exists());
        assert!(!f.backupdir.join("vm1/vm1.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_missing_disk_image_aborts_with_io_error() {
        let f = fixture();
        let mut disks = BTreeMap::new();
        disks.insert("vda".to_string(), f.backupdir.join("nowhere.qcow2"));
        f.mock.add_domain("vm2", disks);

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm2", 1, monday());
        let mut service = f.mock.snapshot_service("vm2");
        let err = run.execute(service.as_mut(), &f.archives).await.unwrap_err();

        assert!(matches!(err, BackupError::Io(_)));
        assert!(f.mock.snapshot_active("vm2"));
    }

    #[tokio::test]
    async fn test_block_device_disk_is_streamed() {
        let f = fixture();
        let device = PathBuf::from("/dev/null");
        f.mock
            .add_domain("vm3", BTreeMap::from([("vda".to_string(), device)]));

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm3", 1, monday());
        let mut service = f.mock.snapshot_service("vm3");
        let output = run.execute(service.as_mut(), &f.archives).await.unwrap();

        assert_eq!(run.state(), &RunState::Done);
        assert!(!f.mock.snapshot_active("vm3"));

        use flate2::read::GzDecoder;
        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(output).unwrap()));
        let sizes: Vec<(String, u64)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.path().unwrap().to_string_lossy().into_owned(), e.size())
            })
            .collect();
        assert!(sizes.contains(&("2024-01-01/null".to_string(), 0)));
    }

    #[tokio::test]
    async fn test_compression_failure_keeps_container() {
        let f = fixture();
        let archives = ArchiveManager::new(Box::new(FailingCompressor));

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &archives).await.unwrap_err();

        assert!(matches!(err, BackupError::Compression(_)));
        let expected = RunState::Aborted {
            after: Box::new(RunState::ArchiveClosed),
            error: err.to_string(),
        };
        assert_eq!(run.state(), &expected);
        assert_eq!(read_journal(run.staging_dir()).unwrap().state, expected);
        assert!(f.backupdir.join("vm1/vm1.tar").is_file());
        assert!(!f.backupdir.join("vm1/vm1.tar.gz").exists());
        assert!(!f.mock.snapshot_active("vm1"));
    }

    #[tokio::test]
    async fn test_descriptor_failure_takes_no_snapshot() {
        let f = fixture();
        f.mock.fail_at("vm1", MockFailure::ExportDescriptor);

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &f.archives).await.unwrap_err();

        assert!(matches!(err, BackupError::Snapshot(_)));
        assert_eq!(
            run.state(),
            &RunState::Aborted {
                after: Box::new(RunState::Rotated),
                error: err.to_string(),
            }
        );
        assert_eq!(f.mock.calls_for("vm1"), vec!["export_descriptor vm1".to_string()]);
        assert!(!f.mock.snapshot_active("vm1"));
    }

    #[tokio::test]
    async fn test_active_snapshot_is_refused() {
        let f = fixture();
        f.mock.set_snapshot_active("vm1", true);

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &f.archives).await.unwrap_err();

        assert!(matches!(err, BackupError::Snapshot(_)));
        assert!(!run.state().overlay_attached());
        assert!(!f
            .mock
            .calls_for("vm1")
            .iter()
            .any(|c| c.starts_with("commit_snapshot")));
    }

    #[tokio::test]
    async fn test_unclean_staging_is_journaled() {
        let f = fixture();
        let staging = f.backupdir.join("vm1/2024-01-01");
        let archives = ArchiveManager::new(Box::new(LitteringCompressor {
            stray: staging.join("stray.img"),
        }));

        let mut run = BackupRun::new(Uuid::new_v4(), &f.backupdir, "vm1", 2, monday());
        let mut service = f.mock.snapshot_service("vm1");
        let err = run.execute(service.as_mut(), &archives).await.unwrap_err();

        assert!(err.to_string().contains("stray.img"));
        assert!(staging.join("stray.img").is_file());
        assert!(f.backupdir.join("vm1/vm1.tar.gz").is_file());
        let record = read_journal(&staging).unwrap();
        assert_eq!(
            record.state,
            RunState::Aborted {
                after: Box::new(RunState::Compressed),
                error: err.to_string(),
            }
        );
    }
}
