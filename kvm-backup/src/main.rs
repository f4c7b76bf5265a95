//! kvm-backup - Main entry point
//!
//! Backs up the libvirt domains configured for this host.

use anyhow::{bail, Result};
use chrono::Local;
use clap::{Parser, ValueEnum};
use kvm_backup::archive::{ArchiveManager, Compressor, GzipCompressor, ProcessCompressor};
use kvm_backup::daemon::{default_lock_path, InstanceLock};
use kvm_backup::{hypervisor, utils, BackupExecutor, LoadedConfig};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Backup of KVM domains", long_about = None)]
struct Args {
    /// The config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Lock file (default: /var/run/<program>.lock)
    #[arg(long, value_name = "FILE")]
    lock_file: Option<PathBuf>,

    /// Wait for a running instance to finish instead of exiting
    #[arg(long)]
    wait_lock: bool,

    /// libvirt connection URI
    #[arg(long, default_value = hypervisor::DEFAULT_URI)]
    connect: String,

    /// Compressor used for the archives
    #[arg(long, value_enum, default_value_t = CompressorKind::Pigz)]
    compressor: CompressorKind,

    /// Exit non-zero when any domain failed
    #[arg(long)]
    strict_exit: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompressorKind {
    Pigz,
    Gzip,
    Builtin,
}

impl CompressorKind {
    fn build(self) -> Box<dyn Compressor> {
        match self {
            CompressorKind::Pigz => Box::new(ProcessCompressor::pigz()),
            CompressorKind::Gzip => Box::new(ProcessCompressor::gzip()),
            CompressorKind::Builtin => Box::new(GzipCompressor::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::logger::init(&args.log_level)?;

    let program = std::env::args()
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let prog_name = Path::new(&program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());

    tracing::info!("Starting {} v{}", prog_name, env!("CARGO_PKG_VERSION"));

    let lock_path = args
        .lock_file
        .clone()
        .unwrap_or_else(|| default_lock_path(&program));
    let lock = match InstanceLock::acquire(&lock_path, args.wait_lock) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::error!(
                "Another instance of {} is running. Please wait for its termination or kill the running application",
                prog_name
            );
            bail!("instance lock {} is held by another process", lock_path.display());
        }
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    let config = match LoadedConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        "Loaded {} domains for host {} from {}",
        config.domains.len(),
        config.host,
        args.config.display()
    );
    config.ensure_backup_root()?;

    let session = hypervisor::connect(&args.connect).await?;

    let archives = ArchiveManager::new(args.compressor.build());
    tracing::debug!("Using compressor {}", archives.compressor_name());
    let executor = BackupExecutor::new(archives);

    let report = executor
        .run(session.as_ref(), &config, Local::now().date_naive())
        .await?;
    report.log_summary();

    lock.release()?;

    if args.strict_exit && report.has_failures() {
        bail!("{} domain backups failed", report.failure_count());
    }

    tracing::info!("{} completed successfully", prog_name);
    Ok(())
}
