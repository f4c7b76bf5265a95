//! kvm-backup Library
//!
//! Scheduled backups of libvirt/KVM domains through live disk-only snapshots,
//! packed into rotated tar.gz archives, one run per host at a time.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod hypervisor;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use config::LoadedConfig;
pub use executor::{BackupExecutor, RunReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
