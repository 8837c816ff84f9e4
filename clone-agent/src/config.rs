//! Configuration management for the clone agent.
//!
//! Loads configuration from an optional TOML file; every field has a default
//! so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::exec::Capability;
use crate::utils::errors::{CloneError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory for staging and extraction temp directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Where `backup` writes the root archive when `--output` is not given
    #[serde(default = "default_work_dir")]
    pub output_dir: PathBuf,

    /// Root archive compression (gzip, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (0-9 for gzip, 1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Cloud provider agents that are never started on the target
    #[serde(default = "default_extra_system_units")]
    pub extra_system_units: Vec<String>,

    /// Port assigned to synthesized Python services without a `PORT=`
    #[serde(default = "default_python_port")]
    pub python_default_port: u16,

    /// Port assigned to synthesized Node services without a `PORT=`
    #[serde(default = "default_node_port")]
    pub node_default_port: u16,

    /// apt packages per capability, replacing the built-in table
    /// (e.g. `mysql = ["mariadb-server"]`)
    #[serde(default)]
    pub apt_packages: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Filesystem root every system path is resolved against
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

// Default values
fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_compression_level() -> i32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_extra_system_units() -> Vec<String> {
    [
        "amazon-ssm-agent",
        "snap.amazon-ssm-agent.amazon-ssm-agent",
        "google-guest-agent",
        "google-osconfig-agent",
        "google-startup-scripts",
        "google-shutdown-scripts",
        "walinuxagent",
        "qemu-guest-agent",
        "droplet-agent",
        "do-agent",
        "hv-kvp-daemon",
        "oracle-cloud-agent",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_python_port() -> u16 {
    8000
}

fn default_node_port() -> u16 {
    3000
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            output_dir: default_work_dir(),
            compression: default_compression(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            extra_system_units: default_extra_system_units(),
            python_default_port: default_python_port(),
            node_default_port: default_node_port(),
            apt_packages: BTreeMap::new(),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| CloneError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bundle.compression.as_str(), "gzip" | "zstd") {
            return Err(CloneError::Config(format!(
                "unsupported bundle compression '{}' (expected gzip or zstd)",
                self.bundle.compression
            )));
        }
        for name in self.restore.apt_packages.keys() {
            if name.parse::<Capability>()? == Capability::Pm2 {
                return Err(CloneError::Config(
                    "[restore] apt_packages: pm2 is installed with npm".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bundle.compression, "gzip");
        assert_eq!(config.restore.python_default_port, 8000);
        assert_eq!(config.layout.root, PathBuf::from("/"));
        assert!(config
            .restore
            .extra_system_units
            .iter()
            .any(|u| u == "amazon-ssm-agent"));
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("clone.toml");
        std::fs::write(
            &path,
            "[bundle]\ncompression = \"zstd\"\ncompression_level = 3\n\n[log]\nlevel = \"debug\"\n",
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.bundle.compression, "zstd");
        assert_eq!(config.bundle.compression_level, 3);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.agent.work_dir, PathBuf::from("/tmp"));
        Ok(())
    }

    #[test]
    fn test_apt_package_overrides() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("clone.toml");
        std::fs::write(&path, "[restore.apt_packages]\nmysql = [\"mariadb-server\"]\n")?;

        let config = Config::from_file(&path)?;
        assert_eq!(
            config.restore.apt_packages.get("mysql"),
            Some(&vec!["mariadb-server".to_string()])
        );
        assert_eq!(config.restore.node_default_port, 3000);

        std::fs::write(&path, "[restore.apt_packages]\nfortran = [\"gfortran\"]\n")?;
        assert!(matches!(Config::from_file(&path), Err(CloneError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_compression() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("clone.toml");
        std::fs::write(&path, "[bundle]\ncompression = \"lz4\"\n")?;

        assert!(matches!(Config::from_file(&path), Err(CloneError::Config(_))));
        Ok(())
    }
}
