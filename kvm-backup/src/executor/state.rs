//! Per-domain run state and its on-disk journal.
//!
//! A run moves through [`RunState`] strictly in order. While the staging
//! directory exists every transition is written to `run-state.json` inside it,
//! so a run that dies half-way leaves a record of the last step it finished.

use crate::utils::{BackupError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Journal file name inside the staging directory
pub const JOURNAL_FILE: &str = "run-state.json";

/// Step of a domain backup run. Each variant names the last completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Init,
    DirectoryPrepared,
    Rotated,
    DescriptorCaptured,
    SnapshotTaken,
    DisksCopied,
    Committed,
    ArchiveClosed,
    Compressed,
    Cleaned,
    Done,
    Aborted { after: Box<RunState>, error: String },
}

impl RunState {
    /// The only state that may follow this one, Aborted aside.
    pub fn next(&self) -> Option<RunState> {
        use RunState::*;
        let next = match self {
            Init => DirectoryPrepared,
            DirectoryPrepared => Rotated,
            Rotated => DescriptorCaptured,
            DescriptorCaptured => SnapshotTaken,
            SnapshotTaken => DisksCopied,
            DisksCopied => Committed,
            Committed => ArchiveClosed,
            ArchiveClosed => Compressed,
            Compressed => Cleaned,
            Cleaned => Done,
            Done | Aborted { .. } => return None,
        };
        Some(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted { .. })
    }

    /// True when a run stopped here would leave a snapshot overlay attached.
    pub fn overlay_attached(&self) -> bool {
        match self {
            RunState::SnapshotTaken | RunState::DisksCopied => true,
            RunState::Aborted { after, .. } => after.overlay_attached(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        use RunState::*;
        match self {
            Init => "init",
            DirectoryPrepared => "directory_prepared",
            Rotated => "rotated",
            DescriptorCaptured => "descriptor_captured",
            SnapshotTaken => "snapshot_taken",
            DisksCopied => "disks_copied",
            Committed => "committed",
            ArchiveClosed => "archive_closed",
            Compressed => "compressed",
            Cleaned => "cleaned",
            Done => "done",
            Aborted { .. } => "aborted",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Aborted { after, error } => write!(f, "aborted after {}: {}", after, error),
            other => f.write_str(other.name()),
        }
    }
}

/// Journal record, serialized as `run-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub domain: String,
    pub date: NaiveDate,
    pub state: RunState,
    pub updated_at: DateTime<Utc>,
}

/// Tracks the state of one run and mirrors it to the journal file.
#[derive(Debug)]
pub struct StateMachine {
    record: RunRecord,
    journal: Option<PathBuf>,
}

impl StateMachine {
    pub fn new(run_id: Uuid, domain: &str, date: NaiveDate) -> Self {
        Self {
            record: RunRecord {
                run_id,
                domain: domain.to_string(),
                date,
                state: RunState::Init,
                updated_at: Utc::now(),
            },
            journal: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.record.state
    }

    /// Start journaling into `dir` (the staging directory).
    pub fn attach_journal(&mut self, dir: &Path) -> Result<()> {
        self.journal = Some(dir.join(JOURNAL_FILE));
        self.persist()
    }

    /// Remove the journal file and stop journaling.
    pub fn detach_journal(&mut self) -> Result<()> {
        if let Some(path) = self.journal.take() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Move to `to`, which must be the successor of the current state.
    pub fn advance(&mut self, to: RunState) -> Result<()> {
        if self.record.state.next().as_ref() != Some(&to) {
            return Err(BackupError::InvalidTransition(format!(
                "{} -> {}",
                self.record.state, to
            )));
        }
        self.set(to)
    }

    /// Move to Aborted, remembering the last completed state.
    pub fn abort(&mut self, error: &BackupError) -> Result<()> {
        if self.record.state.is_terminal() {
            return Err(BackupError::InvalidTransition(format!(
                "{} -> aborted",
                self.record.state
            )));
        }
        let after = Box::new(self.record.state.clone());
        self.set(RunState::Aborted {
            after,
            error: error.to_string(),
        })
    }

    fn set(&mut self, state: RunState) -> Result<()> {
        self.record.state = state;
        self.record.updated_at = Utc::now();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.journal {
            let json = serde_json::to_vec_pretty(&self.record)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

/// Read the journal left in a staging directory, if any.
pub fn read_journal(dir: &Path) -> Option<RunRecord> {
    let content = std::fs::read(dir.join(JOURNAL_FILE)).ok()?;
    serde_json::from_slice(&content).ok()
}
