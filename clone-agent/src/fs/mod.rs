//! File system helpers: exclusion-aware walking and tar archives.

pub mod archive;
pub mod walker;

pub use walker::{walk_directory, WalkOptions, FileInfo};
