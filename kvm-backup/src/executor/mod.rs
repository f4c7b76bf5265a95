//! Backup executor - Drives the domain loop of a backup run.
//!
//! For every configured domain, in name order:
//! - not scheduled today: skipped
//! - unknown to the hypervisor: missing, nothing touched on disk
//! - otherwise: one [`BackupRun`] through the whole pipeline
//!
//! A failing domain never stops the loop.

pub mod run;
pub mod state;

pub use run::BackupRun;
pub use state::{RunRecord, RunState};

use crate::archive::ArchiveManager;
use crate::config::{DomainConfig, LoadedConfig};
use crate::hypervisor::Hypervisor;
use crate::scheduler::is_scheduled_on;
use crate::utils::{BackupError, Result};
use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Outcome of one invocation
#[derive(Debug, Default)]
pub struct RunReport {
    /// Domains backed up, with their archive path
    pub completed: Vec<(String, PathBuf)>,

    /// Domains whose run failed, with the error
    pub failed: Vec<(String, String)>,

    /// Domains not scheduled today
    pub skipped: Vec<String>,

    /// Scheduled domains the hypervisor does not know
    pub missing: Vec<String>,
}

impl RunReport {
    /// Failed plus missing domains.
    pub fn failure_count(&self) -> usize {
        self.failed.len() + self.missing.len()
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }

    pub fn attempted(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    pub fn log_summary(&self) {
        info!(
            completed = self.completed.len(),
            failed = self.failed.len(),
            skipped = self.skipped.len(),
            missing = self.missing.len(),
            "Backup run finished"
        );
        for (domain, err) in &self.failed {
            error!(domain = %domain, error = %err, "Domain backup failed");
        }
        for domain in &self.missing {
            error!(domain = %domain, "Domain not found on hypervisor");
        }
    }
}

/// Main backup executor
pub struct BackupExecutor {
    archives: ArchiveManager,
}

impl BackupExecutor {
    pub fn new(archives: ArchiveManager) -> Self {
        Self { archives }
    }

    /// Back up every configured domain due on `today`.
    ///
    /// Only a failure to enumerate domains is returned as an error.
    pub async fn run(
        &self,
        session: &dyn Hypervisor,
        config: &LoadedConfig,
        today: NaiveDate,
    ) -> Result<RunReport> {
        let known: HashSet<String> = session.list_domains().await?.into_iter().collect();
        debug!(
            "Hypervisor {} reports {} domains",
            session.uri(),
            known.len()
        );

        let mut report = RunReport::default();
        for (name, params) in &config.domains {
            if !is_scheduled_on(&params.day_of_week, today.weekday()) {
                debug!("Ignoring {} domain", name);
                report.skipped.push(name.clone());
                continue;
            }

            if !known.contains(name) {
                error!("{}", BackupError::DomainNotFound(name.clone()));
                report.missing.push(name.clone());
                continue;
            }

            info!("Ready for back up of {}", name);
            let result = self
                .backup_domain(session, &config.backupdir, name, params, today)
                .await;

            match result {
                Ok(output) => report.completed.push((name.clone(), output)),
                Err(e) => {
                    error!("Backup of {} failed: {}", name, e);
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn backup_domain(
        &self,
        session: &dyn Hypervisor,
        backupdir: &Path,
        name: &str,
        params: &DomainConfig,
        today: NaiveDate,
    ) -> Result<PathBuf> {
        let run_id = Uuid::new_v4();
        let span = info_span!("backup", domain = %name, run_id = %run_id);

        async {
            let mut snapshot = session.snapshot_service(name);
            let mut run = BackupRun::new(run_id, backupdir, name, params.rotate, today);
            run.execute(snapshot.as_mut(), &self.archives).await
        }
        .instrument(span)
        .await
    }
}
