//! Backup configuration store.
//!
//! The configuration document is keyed by short hostname so a single file can
//! be shared across hypervisor hosts:
//!
//! ```yaml
//! host1:
//!   backupdir: /backup
//!   domains:
//!     vm1:
//!       day_of_week: [Mon, Thu]
//!       rotate: 2
//! ```
//!
//! Files ending in `.toml` are read as TOML, everything else as YAML.

use crate::utils::{BackupError, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Backup parameters for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Weekdays on which the domain is backed up
    pub day_of_week: HashSet<Weekday>,

    /// Number of historical archives to keep next to the current one
    pub rotate: u32,
}

/// Per-host section of the configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub domains: BTreeMap<String, DomainConfig>,
    pub backupdir: PathBuf,
}

/// Configuration resolved for the current host
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Host section that was selected
    pub host: String,

    /// Configured domains, iterated in name order
    pub domains: BTreeMap<String, DomainConfig>,

    /// Backup root directory
    pub backupdir: PathBuf,

    /// The whole document, all hosts included
    pub raw: serde_yaml::Value,
}

impl LoadedConfig {
    /// Load the section for the current host.
    pub fn load(path: &Path) -> Result<Self> {
        let host = current_host()?;
        Self::load_for_host(path, &host)
    }

    /// Load the section for an explicit host name.
    pub fn load_for_host(path: &Path, host: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let raw = parse_document(path, &content)?;
        Self::from_document(raw, host)
    }

    fn from_document(raw: serde_yaml::Value, host: &str) -> Result<Self> {
        let section = raw
            .get(host)
            .cloned()
            .ok_or_else(|| BackupError::Config(format!("no section for host '{}'", host)))?;

        let host_config: HostConfig = serde_yaml::from_value(section)
            .map_err(|e| BackupError::Config(format!("invalid section for host '{}': {}", host, e)))?;

        Ok(Self {
            host: host.to_string(),
            domains: host_config.domains,
            backupdir: host_config.backupdir,
            raw,
        })
    }

    /// Create the backup root directory if it does not exist yet.
    pub fn ensure_backup_root(&self) -> Result<()> {
        if !self.backupdir.is_dir() {
            tracing::info!("Creating directory {}", self.backupdir.display());
            std::fs::create_dir_all(&self.backupdir)?;
        }
        Ok(())
    }
}

fn parse_document(path: &Path, content: &str) -> Result<serde_yaml::Value> {
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    if is_toml {
        toml::from_str(content)
            .map_err(|e| BackupError::Config(format!("cannot parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| BackupError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

/// Short name of this host (everything before the first dot).
pub fn current_host() -> Result<String> {
    let name = hostname::get()
        .map_err(|e| BackupError::Config(format!("cannot determine hostname: {}", e)))?
        .into_string()
        .map_err(|_| BackupError::Config("hostname is not valid UTF-8".to_string()))?;
    Ok(short_name(&name).to_string())
}

fn short_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
