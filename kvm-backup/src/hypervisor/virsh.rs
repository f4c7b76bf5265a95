//! libvirt backend driven through the `virsh` command line.

use super::{Hypervisor, SnapshotService};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Suffix of the snapshot name created for backups (`<domain>-backup`)
pub const SNAPSHOT_SUFFIX: &str = "backup";

/// `virsh` invocation bound to a connection URI.
#[derive(Debug, Clone)]
struct Virsh {
    program: String,
    uri: String,
}

impl Virsh {
    /// Run `virsh -c <uri> <args>` and return its stdout.
    async fn run(&self, args: &[&str]) -> std::result::Result<String, String> {
        debug!("Running {} -c {} {}", self.program, self.uri, args.join(" "));

        let output = Command::new(&self.program)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("cannot run {}: {}", self.program, e))?;

        if !output.status.success() {
            return Err(format!(
                "virsh {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Hypervisor session backed by `virsh`.
pub struct VirshHypervisor {
    virsh: Virsh,
}

impl VirshHypervisor {
    /// Check that the hypervisor at `uri` answers and return a session.
    pub async fn connect(uri: &str) -> Result<Self> {
        let virsh = Virsh {
            program: "virsh".to_string(),
            uri: uri.to_string(),
        };
        let canonical = virsh.run(&["uri"]).await.map_err(BackupError::Hypervisor)?;
        info!("Connected to hypervisor {}", canonical.trim());
        Ok(Self { virsh })
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    fn uri(&self) -> &str {
        &self.virsh.uri
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        let output = self
            .virsh
            .run(&["list", "--all", "--name"])
            .await
            .map_err(BackupError::Hypervisor)?;
        Ok(parse_name_list(&output))
    }

    fn snapshot_service(&self, domain: &str) -> Box<dyn SnapshotService> {
        Box::new(VirshSnapshot::new(self.virsh.clone(), domain))
    }
}

/// Disk-only external snapshot of one domain.
pub struct VirshSnapshot {
    virsh: Virsh,
    domain: String,
    name: String,
    base_disks: BTreeMap<String, PathBuf>,
    overlays: BTreeMap<String, PathBuf>,
    active: bool,
}

impl VirshSnapshot {
    fn new(virsh: Virsh, domain: &str) -> Self {
        Self {
            virsh,
            domain: domain.to_string(),
            name: format!("{}-{}", domain, SNAPSHOT_SUFFIX),
            base_disks: BTreeMap::new(),
            overlays: BTreeMap::new(),
            active: false,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.virsh.run(args).await.map_err(BackupError::Snapshot)
    }

    async fn block_devices(&self) -> Result<BTreeMap<String, PathBuf>> {
        let output = self.run(&["domblklist", &self.domain, "--details"]).await?;
        Ok(parse_domblklist(&output))
    }

    async fn snapshot_exists(&self) -> Result<bool> {
        let output = self.run(&["snapshot-list", &self.domain, "--name"]).await?;
        Ok(parse_name_list(&output).iter().any(|n| n == &self.name))
    }
}

#[async_trait]
impl SnapshotService for VirshSnapshot {
    #[instrument(skip(self))]
    async fn export_descriptor(&mut self, dest: &Path) -> Result<Vec<PathBuf>> {
        let live = self.run(&["dumpxml", &self.domain]).await?;
        let inactive = self.run(&["dumpxml", "--inactive", &self.domain]).await?;

        let mut files = Vec::with_capacity(2);
        for (name, xml) in [
            (format!("{}.xml", self.domain), live),
            (format!("{}-inactive.xml", self.domain), inactive),
        ] {
            let path = dest.join(name);
            tokio::fs::write(&path, xml).await?;
            debug!("Descriptor written to {}", path.display());
            files.push(path);
        }
        Ok(files)
    }

    #[instrument(skip(self))]
    async fn create_snapshot(&mut self) -> Result<()> {
        if self.active || self.snapshot_exists().await? {
            return Err(BackupError::Snapshot(format!(
                "snapshot {} is already active on {}",
                self.name, self.domain
            )));
        }

        let base_disks = self.block_devices().await?;
        if base_disks.is_empty() {
            return Err(BackupError::Snapshot(format!(
                "{} has no disks to snapshot",
                self.domain
            )));
        }

        self.run(&[
            "snapshot-create-as",
            &self.domain,
            &self.name,
            "--disk-only",
            "--atomic",
        ])
        .await?;
        self.active = true;

        let current = self.block_devices().await?;
        self.overlays = current
            .into_iter()
            .filter(|(target, source)| base_disks.get(target) != Some(source))
            .collect();
        self.base_disks = base_disks;

        info!(
            "Snapshot {} created ({} overlays)",
            self.name,
            self.overlays.len()
        );
        Ok(())
    }

    fn disks(&self) -> Result<BTreeMap<String, PathBuf>> {
        if !self.active {
            return Err(BackupError::Snapshot(format!(
                "no active snapshot on {}",
                self.domain
            )));
        }
        Ok(self.base_disks.clone())
    }

    #[instrument(skip(self))]
    async fn commit_snapshot(&mut self) -> Result<()> {
        if !self.active {
            return Err(BackupError::Snapshot(format!(
                "no active snapshot on {} to commit",
                self.domain
            )));
        }

        for target in self.overlays.keys() {
            debug!("Committing {}", target);
            self.run(&[
                "blockcommit",
                &self.domain,
                target,
                "--active",
                "--pivot",
                "--wait",
            ])
            .await?;
        }

        self.run(&["snapshot-delete", &self.domain, &self.name, "--metadata"])
            .await?;
        self.active = false;

        for overlay in self.overlays.values() {
            if let Err(e) = tokio::fs::remove_file(overlay).await {
                warn!("Failed to remove overlay {}: {}", overlay.display(), e);
            }
        }
        self.overlays.clear();

        info!("Snapshot {} committed", self.name);
        Ok(())
    }
}

/// One name per line, blank lines dropped.
fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `virsh domblklist --details` into target -> source for real disks.
///
/// ```text
///  Type   Device   Target   Source
/// ------------------------------------------------
///  file   disk     vda      /var/lib/libvirt/images/vm1.qcow2
///  file   cdrom    sda      -
/// ```
fn parse_domblklist(output: &str) -> BTreeMap<String, PathBuf> {
    let mut disks = BTreeMap::new();
    for line in output.lines() {
        let mut cols = line.split_whitespace();
        let (Some(_kind), Some(device), Some(target)) = (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        let source = cols.collect::<Vec<_>>().join(" ");
        if device != "disk" || source.is_empty() || source == "-" {
            continue;
        }
        disks.insert(target.to_string(), PathBuf::from(source));
    }
    disks
}
