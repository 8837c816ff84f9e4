//! Utility modules for the clone agent.

pub mod errors;
pub mod logger;

pub use errors::{CloneError, Result};
