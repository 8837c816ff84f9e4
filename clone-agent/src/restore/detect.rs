//! Runtime detection by content sniffing.
//!
//! Detectors look at a [`DirListing`] (names only, no file contents), so the
//! same logic runs over archive members before extraction and over restored
//! trees afterwards.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::RestoreConfig;
use crate::exec::Capability;
use crate::fs::archive::ArchiveEntry;
use crate::fs::walker::{walk_directory, WalkOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
}

impl Runtime {
    pub fn capability(&self) -> Capability {
        match self {
            Runtime::Node => Capability::Node,
            Runtime::Python => Capability::Python,
        }
    }
}

/// File and directory names directly inside one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    /// Logical absolute path of the directory
    pub dir: PathBuf,
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
}

impl DirListing {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_files<I: IntoIterator<Item = &'static str>>(mut self, files: I) -> Self {
        self.files.extend(files.into_iter().map(str::to_string));
        self
    }

    pub fn with_dirs<I: IntoIterator<Item = &'static str>>(mut self, dirs: I) -> Self {
        self.dirs.extend(dirs.into_iter().map(str::to_string));
        self
    }

    fn first_file(&self, candidates: &[&str]) -> Option<String> {
        candidates
            .iter()
            .find(|c| self.files.contains(**c))
            .map(|c| c.to_string())
    }
}

/// What a detector found in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppCapability {
    pub runtime: Runtime,
    pub dir: PathBuf,
    /// Dependency manifest to install from, if any
    pub manifest: Option<PathBuf>,
    /// Entry point file name relative to `dir`
    pub entry_point: Option<String>,
    pub default_port: u16,
    /// Virtualenv directory shipped with the app (`venv` or `.venv`)
    pub venv: Option<String>,
}

pub trait RuntimeDetector {
    fn runtime(&self) -> Runtime;
    fn detect(&self, listing: &DirListing) -> Option<AppCapability>;
}

pub struct NodeDetector {
    pub default_port: u16,
}

const NODE_ENTRY_POINTS: &[&str] = &["server.js", "app.js", "index.js", "main.js"];

impl RuntimeDetector for NodeDetector {
    fn runtime(&self) -> Runtime {
        Runtime::Node
    }

    fn detect(&self, listing: &DirListing) -> Option<AppCapability> {
        if !listing.files.contains("package.json") {
            return None;
        }
        Some(AppCapability {
            runtime: Runtime::Node,
            dir: listing.dir.clone(),
            manifest: Some(listing.dir.join("package.json")),
            entry_point: listing.first_file(NODE_ENTRY_POINTS),
            default_port: self.default_port,
            venv: None,
        })
    }
}

pub struct PythonDetector {
    pub default_port: u16,
}

const PYTHON_ENTRY_POINTS: &[&str] = &["manage.py", "app.py", "main.py", "wsgi.py", "run.py"];
pub const VENV_DIRS: &[&str] = &["venv", ".venv"];

impl RuntimeDetector for PythonDetector {
    fn runtime(&self) -> Runtime {
        Runtime::Python
    }

    fn detect(&self, listing: &DirListing) -> Option<AppCapability> {
        let has_requirements = listing.files.contains("requirements.txt");
        let venv = VENV_DIRS
            .iter()
            .find(|d| listing.dirs.contains(**d))
            .map(|d| d.to_string());
        let has_manage = listing.files.contains("manage.py");
        if !(has_requirements || venv.is_some() || has_manage) {
            return None;
        }
        Some(AppCapability {
            runtime: Runtime::Python,
            dir: listing.dir.clone(),
            manifest: has_requirements.then(|| listing.dir.join("requirements.txt")),
            entry_point: listing.first_file(PYTHON_ENTRY_POINTS),
            default_port: self.default_port,
            venv,
        })
    }
}

pub fn default_detectors(config: &RestoreConfig) -> Vec<Box<dyn RuntimeDetector>> {
    vec![
        Box::new(NodeDetector {
            default_port: config.node_default_port,
        }),
        Box::new(PythonDetector {
            default_port: config.python_default_port,
        }),
    ]
}

pub fn detect_all(detectors: &[Box<dyn RuntimeDetector>], listings: &[DirListing]) -> Vec<AppCapability> {
    listings
        .iter()
        .flat_map(|listing| detectors.iter().filter_map(move |d| d.detect(listing)))
        .collect()
}

/// Group archive members by directory. `base` is the logical directory the
/// archive extracts into.
pub fn listings_from_entries(entries: &[ArchiveEntry], base: &Path) -> Vec<DirListing> {
    let mut by_dir: BTreeMap<PathBuf, DirListing> = BTreeMap::new();
    for entry in entries {
        let path = base.join(entry.path.strip_prefix(".").unwrap_or(&entry.path));
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            continue;
        };
        let name = name.to_string_lossy().into_owned();
        let listing = by_dir
            .entry(parent.to_path_buf())
            .or_insert_with(|| DirListing::new(parent));
        if entry.is_dir {
            listing.dirs.insert(name);
        } else {
            listing.files.insert(name);
        }
    }
    by_dir.into_values().collect()
}

/// Listings for a restored tree on disk. `logical` is the logical path of
/// `physical`.
pub fn listings_from_tree(physical: &Path, logical: &Path) -> Vec<DirListing> {
    let entries: Vec<ArchiveEntry> = walk_directory(physical, WalkOptions::default().with_dirs())
        .unwrap_or_default()
        .into_iter()
        .map(|f| ArchiveEntry {
            path: f.relative_path,
            is_dir: f.is_dir,
        })
        .collect();
    listings_from_entries(&entries, logical)
}

/// Runtimes a unit file relies on, judged from its `ExecStart*` lines.
pub fn unit_runtimes(content: &str) -> BTreeSet<Runtime> {
    let mut runtimes = BTreeSet::new();
    for line in content.lines().map(str::trim) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !key.trim().starts_with("ExecStart") {
            continue;
        }
        let value = value.to_lowercase();
        if ["node", "npm", "pm2"].iter().any(|k| value.contains(k)) {
            runtimes.insert(Runtime::Node);
        }
        if ["python", "gunicorn", "uvicorn"].iter().any(|k| value.contains(k)) {
            runtimes.insert(Runtime::Python);
        }
    }
    runtimes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detectors() -> Vec<Box<dyn RuntimeDetector>> {
        default_detectors(&RestoreConfig::default())
    }

    #[test]
    fn test_node_detector() {
        let listing = DirListing::new("/home/alice/app").with_files(["package.json", "server.js"]);
        let caps = detect_all(&detectors(), &[listing]);

        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].runtime, Runtime::Node);
        assert_eq!(caps[0].manifest, Some(PathBuf::from("/home/alice/app/package.json")));
        assert_eq!(caps[0].entry_point.as_deref(), Some("server.js"));
        assert_eq!(caps[0].default_port, 3000);
    }

    #[test]
    fn test_python_detector_variants() {
        let django = DirListing::new("/home/bob/site").with_files(["manage.py"]);
        let flask = DirListing::new("/home/bob/api")
            .with_files(["requirements.txt", "app.py"])
            .with_dirs(["venv"]);
        let caps = detect_all(&detectors(), &[django, flask]);

        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].entry_point.as_deref(), Some("manage.py"));
        assert_eq!(caps[0].manifest, None);
        assert_eq!(caps[1].manifest, Some(PathBuf::from("/home/bob/api/requirements.txt")));
        assert_eq!(caps[1].venv.as_deref(), Some("venv"));
        assert_eq!(caps[1].default_port, 8000);
    }

    #[test]
    fn test_dot_venv_recorded() {
        let listing = DirListing::new("/home/bob/tool")
            .with_files(["main.py"])
            .with_dirs([".venv"]);
        let caps = detect_all(&detectors(), &[listing]);

        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].runtime, Runtime::Python);
        assert_eq!(caps[0].manifest, None);
        assert_eq!(caps[0].venv.as_deref(), Some(".venv"));
        assert_eq!(caps[0].entry_point.as_deref(), Some("main.py"));
    }

    #[test]
    fn test_nothing_detected_without_markers() {
        let listing = DirListing::new("/opt/svc").with_files(["run.sh", "README.md"]);
        assert!(detect_all(&detectors(), &[listing]).is_empty());
    }

    #[test]
    fn test_listings_from_entries() {
        let entries = vec![
            ArchiveEntry { path: "alice".into(), is_dir: true },
            ArchiveEntry { path: "alice/app".into(), is_dir: true },
            ArchiveEntry { path: "alice/app/package.json".into(), is_dir: false },
            ArchiveEntry { path: "alice/app/venv".into(), is_dir: true },
            ArchiveEntry { path: "alice/.bashrc".into(), is_dir: false },
        ];
        let listings = listings_from_entries(&entries, Path::new("/home"));
        let app = listings
            .iter()
            .find(|l| l.dir == Path::new("/home/alice/app"))
            .expect("app listing");
        assert!(app.files.contains("package.json"));
        assert!(app.dirs.contains("venv"));
    }

    #[test]
    fn test_unit_runtimes() {
        let node = "[Service]\nExecStart=/usr/bin/node /opt/api/server.js\n";
        let python = "[Service]\nExecStart=/opt/web/venv/bin/gunicorn app:app\n";
        let shell = "[Unit]\nDescription=Node exporter\n[Service]\nExecStart=/opt/svc/run.sh\n";

        assert_eq!(unit_runtimes(node), BTreeSet::from([Runtime::Node]));
        assert_eq!(unit_runtimes(python), BTreeSet::from([Runtime::Python]));
        assert!(unit_runtimes(shell).is_empty());
    }
}
