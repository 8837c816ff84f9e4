//! Execution context shared by scan, backup and restore.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use super::{CommandOutput, CommandRunner, CommandSpec, SystemLayout};
use crate::utils::errors::{CloneError, Result};

/// Something the target host may need installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Node,
    Pm2,
    Python,
    Mysql,
    Postgres,
    Mongodb,
    Redis,
    Nginx,
    Apache,
    Docker,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Node,
        Capability::Pm2,
        Capability::Python,
        Capability::Mysql,
        Capability::Postgres,
        Capability::Mongodb,
        Capability::Redis,
        Capability::Nginx,
        Capability::Apache,
        Capability::Docker,
    ];

    /// Binary whose presence means the capability is already installed.
    pub fn binary(&self) -> &'static str {
        match self {
            Capability::Node => "node",
            Capability::Pm2 => "pm2",
            Capability::Python => "python3",
            Capability::Mysql => "mysql",
            Capability::Postgres => "psql",
            Capability::Mongodb => "mongod",
            Capability::Redis => "redis-server",
            Capability::Nginx => "nginx",
            Capability::Apache => "apache2",
            Capability::Docker => "docker",
        }
    }

    /// apt packages providing the capability. Empty for npm-installed tools.
    pub fn apt_packages(&self) -> &'static [&'static str] {
        match self {
            Capability::Node => &["nodejs", "npm"],
            Capability::Pm2 => &[],
            Capability::Python => &["python3", "python3-venv", "python3-pip"],
            Capability::Mysql => &["mysql-server"],
            Capability::Postgres => &["postgresql"],
            Capability::Mongodb => &["mongodb-org"],
            Capability::Redis => &["redis-server"],
            Capability::Nginx => &["nginx"],
            Capability::Apache => &["apache2"],
            Capability::Docker => &["docker.io", "docker-compose-plugin"],
        }
    }

    /// systemd unit started after installation, if any.
    pub fn service_unit(&self) -> Option<&'static str> {
        match self {
            Capability::Mysql => Some("mysql"),
            Capability::Postgres => Some("postgresql"),
            Capability::Mongodb => Some("mongod"),
            Capability::Redis => Some("redis-server"),
            Capability::Nginx => Some("nginx"),
            Capability::Apache => Some("apache2"),
            Capability::Docker => Some("docker"),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Node => "node",
            Capability::Pm2 => "pm2",
            Capability::Python => "python",
            Capability::Mysql => "mysql",
            Capability::Postgres => "postgres",
            Capability::Mongodb => "mongodb",
            Capability::Redis => "redis",
            Capability::Nginx => "nginx",
            Capability::Apache => "apache",
            Capability::Docker => "docker",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Capability {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .into_iter()
            .find(|c| c.to_string() == s)
            .ok_or_else(|| CloneError::Config(format!("unknown capability '{}'", s)))
    }
}

/// Explicit replacement for ambient shell state: who we act for, where the
/// filesystem lives, and what is already installed.
pub struct ExecContext<'a> {
    runner: &'a dyn CommandRunner,
    pub layout: SystemLayout,
    /// Operator-supplied user (source user for backup, fallback owner on restore)
    pub user: String,
    pub hostname: String,
    installed: BTreeSet<Capability>,
    apt_updated: bool,
    /// `[restore] apt_packages` replacements
    apt_overrides: BTreeMap<Capability, Vec<String>>,
}

impl<'a> ExecContext<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: SystemLayout, user: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            runner,
            layout,
            user: user.into(),
            hostname,
            installed: BTreeSet::new(),
            apt_updated: false,
            apt_overrides: BTreeMap::new(),
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    /// Run a command; a non-zero exit becomes `CloneError::Command`.
    pub fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let output = self.runner.run(&spec)?;
        if output.success {
            Ok(output)
        } else {
            Err(CloneError::Command {
                command: spec.display(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run a detection probe. Any failure collapses to `None`.
    pub fn probe(&self, spec: CommandSpec) -> Option<CommandOutput> {
        match self.runner.run(&spec) {
            Ok(output) if output.success => Some(output),
            Ok(output) => {
                debug!("probe `{}` exited with {:?}", spec.display(), output.code);
                None
            }
            Err(e) => {
                debug!("probe `{}` failed: {}", spec.display(), e);
                None
            }
        }
    }

    pub fn has_binary(&self, name: &str) -> bool {
        self.runner.has_binary(name)
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.runner.user_exists(name)
    }

    pub fn unit_active(&self, unit: &str) -> bool {
        self.probe(CommandSpec::new("systemctl").args(["is-active", "--quiet", unit]))
            .is_some()
    }

    pub fn is_installed(&self, capability: Capability) -> bool {
        self.installed.contains(&capability)
    }

    /// Capabilities installed (or found present) during this run.
    pub fn installed(&self) -> impl Iterator<Item = &Capability> {
        self.installed.iter()
    }

    /// Install different apt packages for the named capabilities.
    pub fn override_apt_packages(&mut self, overrides: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (name, packages) in overrides {
            let capability: Capability = name.parse()?;
            self.apt_overrides.insert(capability, packages.clone());
        }
        Ok(())
    }

    fn packages_for(&self, capability: Capability) -> Vec<String> {
        match self.apt_overrides.get(&capability) {
            Some(packages) => packages.clone(),
            None => capability.apt_packages().iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Make sure a capability is present, installing it if the host lacks it.
    ///
    /// Returns `true` when something was installed.
    pub fn ensure(&mut self, capability: Capability) -> Result<bool> {
        if self.installed.contains(&capability) {
            return Ok(false);
        }
        if self.runner.has_binary(capability.binary()) {
            debug!("{} already present", capability);
            self.installed.insert(capability);
            return Ok(false);
        }

        info!("Installing {}", capability);
        if capability == Capability::Pm2 {
            self.ensure(Capability::Node)?;
            self.run(CommandSpec::new("npm").args(["install", "-g", "pm2"]))?;
        } else {
            let packages = self.packages_for(capability);
            self.apt_install(&packages)?;
        }

        if let Some(unit) = capability.service_unit() {
            self.run(CommandSpec::new("systemctl").args(["enable", "--now", unit]))?;
        }

        self.installed.insert(capability);
        Ok(true)
    }

    fn apt_install(&mut self, packages: &[String]) -> Result<()> {
        if !self.apt_updated {
            self.run(
                CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )?;
            self.apt_updated = true;
        }
        self.run(
            CommandSpec::new("apt-get")
                .args(["install", "-y"])
                .args(packages.iter().map(String::as_str))
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(())
    }

    /// `chown -R user:user path`
    pub fn chown_recursive(&self, owner: &str, path: &std::path::Path) -> Result<()> {
        self.run(
            CommandSpec::new("chown")
                .args(["-R", &format!("{owner}:{owner}")])
                .path_arg(path),
        )?;
        Ok(())
    }
}
