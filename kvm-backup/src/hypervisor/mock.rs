//! In-memory hypervisor for testing.
//!
//! Domains are registered with real files as disk images so the pipeline can
//! copy and archive them. Every service call is recorded, and failures can be
//! injected per domain and per operation.

use super::{Hypervisor, SnapshotService};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Operation that a mock domain should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    ExportDescriptor,
    CreateSnapshot,
    CommitSnapshot,
}

#[derive(Debug, Default)]
struct MockDomain {
    disks: BTreeMap<String, PathBuf>,
    snapshot_active: bool,
    fail_at: Option<MockFailure>,
}

#[derive(Debug, Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    calls: Vec<String>,
}

/// Mock hypervisor session. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockHypervisor {
    state: Arc<Mutex<MockState>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain with its disks (device name -> image file).
    pub fn add_domain(&self, name: &str, disks: BTreeMap<String, PathBuf>) {
        self.lock().domains.insert(
            name.to_string(),
            MockDomain {
                disks,
                ..Default::default()
            },
        );
    }

    /// Make `operation` fail for `domain` from now on.
    pub fn fail_at(&self, domain: &str, operation: MockFailure) {
        if let Some(d) = self.lock().domains.get_mut(domain) {
            d.fail_at = Some(operation);
        }
    }

    /// Mark a snapshot as already active, as after an interrupted run.
    pub fn set_snapshot_active(&self, domain: &str, active: bool) {
        if let Some(d) = self.lock().domains.get_mut(domain) {
            d.snapshot_active = active;
        }
    }

    pub fn snapshot_active(&self, domain: &str) -> bool {
        self.lock()
            .domains
            .get(domain)
            .map(|d| d.snapshot_active)
            .unwrap_or(false)
    }

    /// Recorded calls, e.g. `"create_snapshot vm1"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Recorded calls for one domain.
    pub fn calls_for(&self, domain: &str) -> Vec<String> {
        let suffix = format!(" {}", domain);
        self.lock()
            .calls
            .iter()
            .filter(|c| c.ends_with(&suffix))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn uri(&self) -> &str {
        "mock:///"
    }

    async fn list_domains(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push("list_domains".to_string());
        Ok(state.domains.keys().cloned().collect())
    }

    fn snapshot_service(&self, domain: &str) -> Box<dyn SnapshotService> {
        Box::new(MockSnapshot {
            hypervisor: self.clone(),
            domain: domain.to_string(),
        })
    }
}

struct MockSnapshot {
    hypervisor: MockHypervisor,
    domain: String,
}

impl MockSnapshot {
    /// Record the call and run `f` against the domain's state.
    fn with_domain<T>(
        &self,
        operation: &str,
        failure: Option<MockFailure>,
        f: impl FnOnce(&mut MockDomain) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.hypervisor.lock();
        state.calls.push(format!("{} {}", operation, self.domain));
        debug!("mock {} {}", operation, self.domain);

        let domain = state
            .domains
            .get_mut(&self.domain)
            .ok_or_else(|| BackupError::Snapshot(format!("unknown domain {}", self.domain)))?;

        if failure.is_some() && domain.fail_at == failure {
            return Err(BackupError::Snapshot(format!(
                "injected {} failure on {}",
                operation, self.domain
            )));
        }
        f(domain)
    }
}

#[async_trait]
impl SnapshotService for MockSnapshot {
    async fn export_descriptor(&mut self, dest: &Path) -> Result<Vec<PathBuf>> {
        let name = self.domain.clone();
        self.with_domain(
            "export_descriptor",
            Some(MockFailure::ExportDescriptor),
            |_| Ok(()),
        )?;

        let path = dest.join(format!("{}.xml", name));
        std::fs::write(&path, format!("<domain type='kvm'><name>{}</name></domain>\n", name))?;
        Ok(vec![path])
    }

    async fn create_snapshot(&mut self) -> Result<()> {
        let name = self.domain.clone();
        self.with_domain("create_snapshot", Some(MockFailure::CreateSnapshot), |d| {
            if d.snapshot_active {
                return Err(BackupError::Snapshot(format!(
                    "snapshot already active on {}",
                    name
                )));
            }
            d.snapshot_active = true;
            Ok(())
        })
    }

    fn disks(&self) -> Result<BTreeMap<String, PathBuf>> {
        let name = self.domain.clone();
        self.with_domain("disks", None, |d| {
            if !d.snapshot_active {
                return Err(BackupError::Snapshot(format!("no active snapshot on {}", name)));
            }
            Ok(d.disks.clone())
        })
    }

    async fn commit_snapshot(&mut self) -> Result<()> {
        let name = self.domain.clone();
        self.with_domain("commit_snapshot", Some(MockFailure::CommitSnapshot), |d| {
            if !d.snapshot_active {
                return Err(BackupError::Snapshot(format!(
                    "no active snapshot on {} to commit",
                    name
                )));
            }
            d.snapshot_active = false;
            Ok(())
        })
    }
}
