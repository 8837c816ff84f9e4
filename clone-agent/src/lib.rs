//! Server Clone Agent Library
//!
//! Scans a Linux host, backs its runtime state up into a single bundle and
//! restores such a bundle onto another host.

pub mod backup;
pub mod config;
pub mod exec;
pub mod fs;
pub mod inventory;
pub mod manifest;
pub mod naming;
pub mod report;
pub mod restore;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use exec::{CommandRunner, ExecContext, SystemLayout, SystemRunner};
pub use inventory::Inventory;
pub use report::RunReport;
pub use utils::errors::{CloneError, Result};
