//! Side-car manifest for a backup bundle.
//!
//! The manifest records, for every artifact, where it sits inside the bundle
//! and the structured origin it was produced from. Restore trusts the
//! manifest over anything encoded in file names; bundles without one are
//! indexed by decoding member names instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::naming::{self, ArtifactKind, Origin};
use crate::utils::errors::Result;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Backup manifest, serialized as `manifest.json` at the bundle root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

/// One artifact in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: ArtifactKind,
    /// Path relative to the bundle root, e.g. `apps/home-alice.tar.gz`
    pub archive_path: PathBuf,
    /// Original absolute path, when the artifact has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    /// User, database, volume or unit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Account that should own the restored files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl ManifestEntry {
    pub fn new(kind: ArtifactKind, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            archive_path: archive_path.into(),
            original_path: None,
            identity: None,
            owner: None,
        }
    }

    pub fn original_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.original_path = Some(path.into());
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn file_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn has_kind(&self, kind: ArtifactKind) -> bool {
        self.of_kind(kind).next().is_some()
    }

    pub fn write(&self, bundle_root: &Path) -> Result<()> {
        std::fs::write(
            bundle_root.join(MANIFEST_FILE),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }

    /// Read `manifest.json`, or rebuild an index from member names.
    pub fn load_or_index(bundle_root: &Path) -> Result<Self> {
        let path = bundle_root.join(MANIFEST_FILE);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&content)?);
        }
        warn!("Bundle has no {}; decoding artifact names", MANIFEST_FILE);
        Self::index_by_name(bundle_root)
    }

    fn index_by_name(bundle_root: &Path) -> Result<Self> {
        let mut manifest = Self::new();
        for dir in ["apps", "databases", "docker", "configs/env", "system/systemd", "system"] {
            let full = bundle_root.join(dir);
            if !full.is_dir() {
                continue;
            }
            let mut names: Vec<String> = std::fs::read_dir(&full)?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();

            for name in names {
                let Some((kind, origin)) = naming::decode(&name, dir == "configs/env") else {
                    continue;
                };
                // `system/` also holds systemd/; only crontabs live at its top level
                if dir == "system" && kind != ArtifactKind::Crontab {
                    continue;
                }
                let mut entry = ManifestEntry::new(kind, Path::new(dir).join(&name));
                match origin {
                    Origin::Path(p) => {
                        if let Some(owner) = crate::exec::SystemLayout::owner_of(&p) {
                            entry = entry.owner(owner);
                        }
                        entry = entry.original_path(p);
                    }
                    Origin::Name(n) | Origin::Basename(n) => {
                        if kind == ArtifactKind::Home {
                            entry = entry.owner(n.clone());
                        }
                        entry = entry.identity(n);
                    }
                }
                manifest.push(entry);
            }
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manifest = Manifest::new();
        manifest.push(
            ManifestEntry::new(ArtifactKind::NginxRoot, "apps/nginx-root_var_www_my_site.tar.gz")
                .original_path("/var/www/my_site")
                .owner("www-data"),
        );
        manifest.write(dir.path())?;

        let loaded = Manifest::load_or_index(dir.path())?;
        let entry = loaded.of_kind(ArtifactKind::NginxRoot).next().expect("entry");
        // the manifest keeps the underscore the file name cannot
        assert_eq!(entry.original_path.as_deref(), Some(Path::new("/var/www/my_site")));
        Ok(())
    }

    #[test]
    fn test_index_without_manifest() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("apps"))?;
        fs::create_dir_all(dir.path().join("databases"))?;
        fs::create_dir_all(dir.path().join("configs/env"))?;
        fs::create_dir_all(dir.path().join("system/systemd"))?;
        fs::write(dir.path().join("apps/home-alice.tar.gz"), b"")?;
        fs::write(dir.path().join("apps/pm2-processes.json"), b"[]")?;
        fs::write(dir.path().join("databases/mysql-shop.sql"), b"")?;
        fs::write(dir.path().join("configs/env/_home_alice_app_.env"), b"PORT=1")?;
        fs::write(dir.path().join("system/systemd/api.service"), b"")?;
        fs::write(dir.path().join("system/crontab-alice"), b"")?;
        fs::write(dir.path().join("system/os-release"), b"")?;

        let manifest = Manifest::load_or_index(dir.path())?;
        assert_eq!(manifest.entries.len(), 5);

        let home = manifest.of_kind(ArtifactKind::Home).next().expect("home");
        assert_eq!(home.owner.as_deref(), Some("alice"));

        let env = manifest.of_kind(ArtifactKind::EnvFile).next().expect("env");
        assert_eq!(env.original_path.as_deref(), Some(Path::new("/home/alice/app/.env")));
        assert_eq!(env.owner.as_deref(), Some("alice"));

        assert!(manifest.has_kind(ArtifactKind::UnitFile));
        assert!(manifest.has_kind(ArtifactKind::Crontab));
        assert!(manifest.has_kind(ArtifactKind::MysqlDb));
        Ok(())
    }
}
