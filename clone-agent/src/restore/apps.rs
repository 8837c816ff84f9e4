//! Users, application trees and their dependencies.

use std::path::Path;
use tracing::debug;

use super::detect::{AppCapability, Runtime, VENV_DIRS};
use crate::exec::{CommandSpec, ExecContext};
use crate::inventory::Pm2Process;
use crate::utils::errors::Result;

/// Whether a user had to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    Created,
    Existing,
}

/// Create `user` with a home directory unless it already exists.
pub fn ensure_user(ctx: &ExecContext, user: &str) -> Result<UserOutcome> {
    if user == "root" || ctx.user_exists(user) {
        return Ok(UserOutcome::Existing);
    }
    ctx.run(CommandSpec::new("useradd").args(["-m", "-s", "/bin/bash", user]))?;
    Ok(UserOutcome::Created)
}

/// Run `spec` as `owner`, or directly when the owner is root.
pub fn as_owner(spec: CommandSpec, owner: &str) -> CommandSpec {
    if owner == "root" {
        spec
    } else {
        spec.as_user(owner)
    }
}

/// Install an app's dependencies in its directory as its owner.
///
/// `physical` is where `app.dir` lives on this host. Returns `false` when
/// the app has no dependency manifest.
pub fn install_dependencies(
    ctx: &ExecContext,
    app: &AppCapability,
    physical: &Path,
    owner: &str,
) -> Result<bool> {
    if app.manifest.is_none() {
        return Ok(false);
    }
    match app.runtime {
        Runtime::Node => {
            ctx.run(as_owner(CommandSpec::new("npm").arg("install").cwd(physical), owner))?;
        }
        Runtime::Python => {
            // the shipped venv keeps its name so synthesized units find it
            let venv = app
                .venv
                .clone()
                .or_else(|| {
                    VENV_DIRS
                        .iter()
                        .find(|d| physical.join(d).join("bin/pip").exists())
                        .map(|d| d.to_string())
                })
                .unwrap_or_else(|| "venv".to_string());
            if !physical.join(&venv).join("bin/pip").exists() {
                ctx.run(as_owner(
                    CommandSpec::new("python3").args(["-m", "venv", venv.as_str()]).cwd(physical),
                    owner,
                ))?;
            }
            ctx.run(as_owner(
                CommandSpec::new(format!("{}/bin/pip", venv))
                    .args(["install", "-r", "requirements.txt"])
                    .cwd(physical),
                owner,
            ))?;
        }
    }
    Ok(true)
}

/// `PORT=` from an env file, ignoring comments and `export`.
pub fn read_env_port(content: &str) -> Option<u16> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("export ").unwrap_or(l).split_once('='))
        .filter(|(k, _)| k.trim() == "PORT")
        .filter_map(|(_, v)| v.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok())
        .last()
}

/// Later sources win: default, then the process list, then the env file.
pub fn resolve_port(default: u16, from_process: Option<u16>, from_env: Option<u16>) -> u16 {
    from_env.or(from_process).unwrap_or(default)
}

/// Start one PM2 process as its owner. `physical_cwd` is where its recorded
/// cwd lives on this host.
pub fn start_pm2_process(
    ctx: &ExecContext,
    process: &Pm2Process,
    physical_cwd: &Path,
    owner: &str,
    port: Option<u16>,
) -> Result<()> {
    let mut spec = CommandSpec::new("pm2")
        .arg("start")
        .path_arg(&process.script())
        .args(["--name", process.name.as_str()])
        .cwd(physical_cwd);
    if let Some(port) = port {
        spec = spec.env("PORT", port.to_string());
    }
    debug!("Starting pm2 process {} as {}", process.name, owner);
    ctx.run(as_owner(spec, owner))?;
    Ok(())
}

/// Persist the PM2 process list and register its boot unit.
pub fn save_pm2(ctx: &ExecContext, owner: &str, home: &Path) -> Result<()> {
    ctx.run(as_owner(CommandSpec::new("pm2").arg("save"), owner))?;
    ctx.run(
        CommandSpec::new("pm2")
            .args(["startup", "systemd", "-u", owner, "--hp"])
            .path_arg(home),
    )?;
    Ok(())
}
