//! Well-known system locations, resolved beneath a configurable root.
//!
//! Artifacts always record *logical* absolute paths (`/home/alice/app`);
//! the layout turns them into the physical path on this host.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLayout {
    root: PathBuf,
}

impl Default for SystemLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SystemLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical absolute path onto this layout's root.
    pub fn resolve(&self, logical: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = logical
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    /// Inverse of [`resolve`](Self::resolve) for paths found under the root.
    pub fn logical(&self, physical: &Path) -> PathBuf {
        match physical.strip_prefix(&self.root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => physical.to_path_buf(),
        }
    }

    /// Logical home directory of a user.
    pub fn home_of(user: &str) -> PathBuf {
        if user == "root" {
            PathBuf::from("/root")
        } else {
            Path::new("/home").join(user)
        }
    }

    /// Owner implied by a logical path under `/home/<user>` or `/root`.
    pub fn owner_of(logical: &Path) -> Option<String> {
        let mut components = logical.components().filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        });
        match components.next().as_deref() {
            Some("home") => components.next(),
            Some("root") => Some("root".to_string()),
            _ => None,
        }
    }

    pub fn homes(&self) -> PathBuf {
        self.resolve("/home")
    }

    pub fn systemd_dir(&self) -> PathBuf {
        self.resolve("/etc/systemd/system")
    }

    pub fn proxy_dir(&self, subsystem: &str) -> PathBuf {
        match subsystem {
            "apache" => self.resolve("/etc/apache2"),
            other => self.resolve(Path::new("/etc").join(other)),
        }
    }

    pub fn docker_volume_data(&self, volume: &str) -> PathBuf {
        self.resolve("/var/lib/docker/volumes").join(volume).join("_data")
    }

    pub fn redis_dump(&self) -> PathBuf {
        self.resolve("/var/lib/redis/dump.rdb")
    }

    pub fn passwd(&self) -> PathBuf {
        self.resolve("/etc/passwd")
    }

    pub fn os_release(&self) -> PathBuf {
        self.resolve("/etc/os-release")
    }
}
