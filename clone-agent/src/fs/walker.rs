//! Directory traversal with the fixed backup exclusion list.
//!
//! Excluded directories are pruned, so nothing below `node_modules/` (or any
//! other excluded name) is ever visited.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Regeneratable subtrees and files never copied into home or app archives.
/// Entries starting with `*` match by suffix, all others by exact name.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // dependency caches
    "node_modules",
    "bower_components",
    "__pycache__",
    ".npm",
    ".cache",
    ".yarn",
    // build outputs
    "dist",
    "build",
    ".next",
    "target",
    // process manager state and logs
    ".pm2",
    "*.log",
    "*.pyc",
    // vcs internals
    ".git",
    ".svn",
    ".hg",
];

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns (`*suffix` or exact name)
    pub exclude_patterns: Vec<String>,

    /// Report directories as well as files
    pub include_dirs: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            include_dirs: false,
        }
    }
}

impl WalkOptions {
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_dirs(mut self) -> Self {
        self.include_dirs = true;
        self
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (of the link itself for symlinks)
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,

    /// File depth from root
    pub depth: usize,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::symlink_metadata(entry.path())?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            depth: entry.depth(),
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Walk a directory tree and collect every entry that survives exclusion.
/// The root itself is never reported.
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file.clone()))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each entry
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = options.exclude_patterns;
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(&e.file_name().to_string_lossy(), &patterns));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            // only an unreadable root fails the walk
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        if entry.file_type().is_dir() && !options.include_dirs {
            continue;
        }
        match FileInfo::from_entry(&entry, root) {
            Ok(info) => callback(&info),
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok(())
}

/// Find files whose name satisfies `matches`, pruning excluded subtrees.
pub fn find_files<P>(root: &Path, max_depth: usize, matches: P) -> Vec<PathBuf>
where
    P: Fn(&str) -> bool,
{
    if !root.is_dir() {
        return Vec::new();
    }
    let mut found = Vec::new();
    // a root that vanished since the check yields nothing
    let _ = walk_directory_with_callback(root, WalkOptions::default().max_depth(max_depth), |f| {
        if !f.is_dir && matches(&f.file_name()) {
            found.push(f.path.clone());
        }
    });
    found
}

/// Check a file name against exclusion patterns
pub fn is_excluded(file_name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => file_name.ends_with(suffix),
        None => file_name == pattern,
    })
}
