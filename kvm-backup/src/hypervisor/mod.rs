//! Hypervisor session and per-domain snapshot services.
//!
//! The backup pipeline only talks to these traits. `virsh` drives a real
//! libvirt host; `mock` keeps everything in memory for tests.

pub mod mock;
pub mod virsh;

use crate::utils::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use mock::{MockFailure, MockHypervisor};
pub use virsh::VirshHypervisor;

/// Default libvirt connection URI
pub const DEFAULT_URI: &str = "qemu:///system";

/// An open connection to the hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Connection URI (for logging)
    fn uri(&self) -> &str;

    /// Names of all domains the hypervisor knows, running or not.
    async fn list_domains(&self) -> Result<Vec<String>>;

    /// Snapshot service bound to one domain.
    fn snapshot_service(&self, domain: &str) -> Box<dyn SnapshotService>;
}

/// Live snapshot operations for a single domain.
///
/// Call order within a run is `export_descriptor`, `create_snapshot`,
/// `disks`, `commit_snapshot`.
#[async_trait]
pub trait SnapshotService: Send {
    /// Write the domain descriptor file(s) into `dest` and return their paths.
    async fn export_descriptor(&mut self, dest: &Path) -> Result<Vec<PathBuf>>;

    /// Create a disk-only copy-on-write snapshot of every attached disk.
    ///
    /// Fails if a snapshot is already active for the domain.
    async fn create_snapshot(&mut self) -> Result<()>;

    /// Device name to base image path of the disks frozen by the snapshot.
    fn disks(&self) -> Result<BTreeMap<String, PathBuf>>;

    /// Merge the overlays back into their base images and drop the snapshot.
    ///
    /// Fails if no snapshot is active.
    async fn commit_snapshot(&mut self) -> Result<()>;
}

/// Open a session to the hypervisor at `uri`.
pub async fn connect(uri: &str) -> Result<Box<dyn Hypervisor>> {
    let session = VirshHypervisor::connect(uri).await?;
    Ok(Box::new(session))
}
