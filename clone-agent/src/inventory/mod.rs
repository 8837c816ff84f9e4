//! Inventory of a source host.
//!
//! Produced once by `scan`, read-only afterwards, and embedded into the
//! bundle as `inventory.json`.

pub mod probe;

pub use probe::scan;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::errors::{CloneError, Result};

/// Unit name prefixes that belong to the OS rather than to workloads.
pub const SYSTEM_UNIT_PREFIXES: &[&str] = &[
    "snap", "cloud", "ssh", "systemd", "getty", "user@", "dbus",
];

/// MySQL schemas that exist on every server.
pub const MYSQL_SYSTEM_DATABASES: &[&str] =
    &["information_schema", "performance_schema", "mysql", "sys"];

pub const POSTGRES_SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

pub const MONGO_SYSTEM_DATABASES: &[&str] = &["admin", "config", "local"];

/// Whether a unit is part of the base system (or a cloud agent) and must
/// not be copied or started.
pub fn is_system_unit(unit: &str, extra: &[String]) -> bool {
    let name = unit.strip_suffix(".service").unwrap_or(unit);
    SYSTEM_UNIT_PREFIXES.iter().any(|p| name.starts_with(p))
        || extra.iter().any(|e| e == name)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub docker: DockerInfo,
    pub pm2: Pm2Info,
    pub nginx: ProxyInfo,
    pub apache: ProxyInfo,
    pub databases: Databases,
    pub systemd_services: Vec<String>,
    pub ports: Vec<u16>,
    pub users: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub crontabs: BTreeMap<String, Vec<String>>,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerInfo {
    pub installed: bool,
    pub containers: Vec<String>,
    pub volumes: Vec<String>,
    pub compose_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pm2Info {
    pub installed: bool,
    pub processes: Vec<Pm2Process>,
}

/// A PM2 process, keeping the `pm2 jlist` shape for the fields we use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pm2Process {
    pub name: String,
    #[serde(default)]
    pub pm2_env: Pm2Env,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pm2Env {
    pub pm_cwd: PathBuf,
    #[serde(default)]
    pub pm_exec_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Pm2Process {
    /// Script path relative to the working directory, when it lives inside it.
    pub fn script(&self) -> PathBuf {
        let exec = &self.pm2_env.pm_exec_path;
        exec.strip_prefix(&self.pm2_env.pm_cwd)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| exec.clone())
    }

    pub fn port(&self) -> Option<u16> {
        self.pm2_env.env.get("PORT").and_then(|p| p.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyInfo {
    pub running: bool,
    pub sites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Databases {
    pub mysql: DbServer,
    pub postgres: DbServer,
    pub mongodb: DbServer,
    pub redis: DbServer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbServer {
    pub running: bool,
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub os: String,
    pub version: String,
    pub hostname: String,
    pub scan_date: String,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CloneError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
