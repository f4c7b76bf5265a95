//! Process-level concerns of a backup run.

pub mod lock;

pub use lock::{default_lock_path, InstanceLock};
