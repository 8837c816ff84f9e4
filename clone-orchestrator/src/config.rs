use std::path::PathBuf;

use crate::error::{OrchestratorError, Result};

pub const USAGE: &str = "\
Usage: clone-orchestrator

Configuration is read from the environment (or a .env file):
  SOURCE_HOST, SOURCE_USER, SOURCE_PASSWORD   source server (required)
  SOURCE_PORT                                 default 22
  TARGET_HOST, TARGET_USER, TARGET_PASSWORD   target server (required)
  TARGET_PORT                                 default 22
  CLONE_USERNAME                              application user (required)
  AGENT_BINARY                                server-clone binary to upload
  LOCAL_STAGING_DIR                           default /tmp";

/// SSH credentials for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub source: HostConfig,
    pub target: HostConfig,
    /// Application user passed to `backup` and `restore`
    pub clone_user: String,
    pub agent_binary: PathBuf,
    pub staging_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source. Every missing required
    /// variable is reported at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut required = |name: &str| -> String {
            match lookup(name).filter(|v| !v.is_empty()) {
                Some(value) => value,
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        };

        let source_host = required("SOURCE_HOST");
        let source_user = required("SOURCE_USER");
        let source_password = required("SOURCE_PASSWORD");
        let target_host = required("TARGET_HOST");
        let target_user = required("TARGET_USER");
        let target_password = required("TARGET_PASSWORD");
        let clone_user = required("CLONE_USERNAME");
        if !missing.is_empty() {
            return Err(OrchestratorError::MissingVar(missing));
        }

        let port = |name: &str| -> Result<u16> {
            match lookup(name) {
                None => Ok(22),
                Some(value) => value.parse().map_err(|_| OrchestratorError::InvalidVar {
                    name: name.to_string(),
                    value,
                }),
            }
        };

        Ok(Self {
            source: HostConfig {
                host: source_host,
                port: port("SOURCE_PORT")?,
                user: source_user,
                password: source_password,
            },
            target: HostConfig {
                host: target_host,
                port: port("TARGET_PORT")?,
                user: target_user,
                password: target_password,
            },
            clone_user,
            agent_binary: lookup("AGENT_BINARY")
                .map(PathBuf::from)
                .unwrap_or_else(default_agent_binary),
            staging_dir: PathBuf::from(
                lookup("LOCAL_STAGING_DIR").unwrap_or_else(|| "/tmp".into()),
            ),
        })
    }
}

pub fn default_agent_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target/release/server-clone")
}
