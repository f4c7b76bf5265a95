//! Custom error types for kvm-backup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Domain not found on hypervisor: {0}")]
    DomainNotFound(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_not_found_message() {
        let err = BackupError::DomainNotFound("vm1".into());
        assert_eq!(err.to_string(), "Domain not found on hypervisor: vm1");
    }

    #[test]
    fn test_io_conversion() {
        let err: BackupError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, BackupError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
