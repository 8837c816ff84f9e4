//! Source-to-target clone run: install the agent on both hosts, back the
//! source up, ship the bundle through local staging and restore it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::ssh::{shell_quote, RemoteHost};

pub const REMOTE_BINARY_PATH: &str = "/usr/local/bin/server-clone";

/// Per-run temp paths, identical on both hosts.
#[derive(Debug, Clone)]
pub struct RemotePaths {
    pub work_dir: String,
    pub upload: String,
    pub inventory: String,
    pub bundle: String,
    pub report: String,
}

impl RemotePaths {
    pub fn new(run_id: Uuid) -> Self {
        let work_dir = format!("/tmp/server-clone-{}", run_id);
        Self {
            upload: format!("{}/server-clone.upload", work_dir),
            inventory: format!("{}/inventory.json", work_dir),
            bundle: format!("{}/server-backup.tar", work_dir),
            report: format!("{}/restore-report.json", work_dir),
            work_dir,
        }
    }
}

pub fn install_agent_command(paths: &RemotePaths) -> String {
    format!("install -m 0755 {} {}", paths.upload, REMOTE_BINARY_PATH)
}

pub fn scan_command(paths: &RemotePaths) -> String {
    format!("{} scan --output {}", REMOTE_BINARY_PATH, paths.inventory)
}

pub fn backup_command(paths: &RemotePaths, user: &str) -> String {
    format!(
        "{} backup --inventory {} --user {} --output {}",
        REMOTE_BINARY_PATH,
        paths.inventory,
        shell_quote(user),
        paths.bundle
    )
}

pub fn restore_command(paths: &RemotePaths, user: &str) -> String {
    format!(
        "{} restore --backup {} --user {} --report {}",
        REMOTE_BINARY_PATH,
        paths.bundle,
        shell_quote(user),
        paths.report
    )
}

/// Restore report as written by `server-clone restore --report`.
#[derive(Debug, Deserialize)]
pub struct RemoteReport {
    pub records: Vec<RemoteRecord>,
    #[serde(default)]
    pub verification: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteRecord {
    pub phase: String,
    pub subject: String,
    pub status: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RemoteReport {
    fn count(&self, status: &str) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub local_bundle: PathBuf,
    pub done: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
    pub verification: Vec<String>,
}

impl RunSummary {
    fn from_report(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        local_bundle: PathBuf,
        report: RemoteReport,
    ) -> Self {
        let failures = report
            .records
            .iter()
            .filter(|r| r.status == "failed")
            .map(|r| {
                format!(
                    "[{}] {}: {}",
                    r.phase,
                    r.subject,
                    r.detail.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            local_bundle,
            done: report.count("done"),
            skipped: report.count("skipped"),
            failures,
            verification: report.verification,
        }
    }
}

/// Blocking; callers run it on `spawn_blocking`.
pub fn run(config: &OrchestratorConfig, run_id: Uuid) -> Result<RunSummary> {
    let started_at = Utc::now();
    let paths = RemotePaths::new(run_id);
    let staging = config.staging_dir.join(format!("server-clone-{}", run_id));
    std::fs::create_dir_all(&staging)?;
    let local_bundle = staging.join(format!("server-backup-{}.tar", config.source.host));

    tracing::info!(%run_id, source = %config.source.host, target = %config.target.host, "Starting clone run");

    {
        let source = RemoteHost::connect(&config.source)?;
        let result = backup_source(&source, config, &paths, &local_bundle);
        cleanup(&source, &paths);
        result?;
    }

    let report = {
        let target = RemoteHost::connect(&config.target)?;
        let result = restore_target(&target, config, &paths, &local_bundle, &staging);
        cleanup(&target, &paths);
        result?
    };

    Ok(RunSummary::from_report(run_id, started_at, local_bundle, report))
}

fn prepare_host(host: &RemoteHost, config: &OrchestratorConfig, paths: &RemotePaths) -> Result<()> {
    host.exec(&format!("mkdir -p {}", paths.work_dir))?;
    host.upload(&config.agent_binary, &paths.upload)?;
    host.sudo(&install_agent_command(paths))?;
    tracing::info!(host = %host.host(), "Agent installed at {}", REMOTE_BINARY_PATH);
    Ok(())
}

fn backup_source(
    source: &RemoteHost,
    config: &OrchestratorConfig,
    paths: &RemotePaths,
    local_bundle: &Path,
) -> Result<()> {
    prepare_host(source, config, paths)?;

    tracing::info!(host = %source.host(), "Scanning source");
    source.sudo(&scan_command(paths))?;

    tracing::info!(host = %source.host(), user = %config.clone_user, "Backing up source");
    let output = source.sudo(&backup_command(paths, &config.clone_user))?;
    log_remote_output(source.host(), &output);

    // The agent writes the bundle as root
    source.sudo(&format!("chmod 0644 {}", paths.bundle))?;
    source.download(&paths.bundle, local_bundle)?;
    Ok(())
}

fn restore_target(
    target: &RemoteHost,
    config: &OrchestratorConfig,
    paths: &RemotePaths,
    local_bundle: &Path,
    staging: &Path,
) -> Result<RemoteReport> {
    prepare_host(target, config, paths)?;
    target.upload(local_bundle, &paths.bundle)?;

    tracing::info!(host = %target.host(), user = %config.clone_user, "Restoring on target");
    let output = target.sudo(&restore_command(paths, &config.clone_user))?;
    log_remote_output(target.host(), &output);

    target.sudo(&format!("chmod 0644 {}", paths.report))?;
    let local_report = staging.join("restore-report.json");
    target.download(&paths.report, &local_report)?;
    let content = std::fs::read_to_string(&local_report)?;
    let report = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid restore report from {}: {}", target.host(), e))?;
    Ok(report)
}

/// Best effort; a failed cleanup never fails the run.
fn cleanup(host: &RemoteHost, paths: &RemotePaths) {
    if let Err(e) = host.sudo(&format!("rm -rf {}", paths.work_dir)) {
        tracing::warn!(host = %host.host(), error = %e, "Failed to remove {}", paths.work_dir);
    }
}

fn log_remote_output(host: &str, output: &str) {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        tracing::info!(host, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> RemotePaths {
        let id = Uuid::parse_str("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap();
        RemotePaths::new(id)
    }

    #[test]
    fn test_remote_paths_share_run_dir() {
        let paths = paths();
        assert_eq!(paths.work_dir, "/tmp/server-clone-1b4e28ba-2fa1-11d2-883f-0016d3cca427");
        for path in [&paths.upload, &paths.inventory, &paths.bundle, &paths.report] {
            assert!(path.starts_with(&paths.work_dir));
        }
    }

    #[test]
    fn test_agent_commands() {
        let paths = paths();
        assert_eq!(
            scan_command(&paths),
            format!("/usr/local/bin/server-clone scan --output {}/inventory.json", paths.work_dir)
        );
        assert_eq!(
            backup_command(&paths, "alice"),
            format!(
                "/usr/local/bin/server-clone backup --inventory {0}/inventory.json --user alice --output {0}/server-backup.tar",
                paths.work_dir
            )
        );
        assert_eq!(
            restore_command(&paths, "alice"),
            format!(
                "/usr/local/bin/server-clone restore --backup {0}/server-backup.tar --user alice --report {0}/restore-report.json",
                paths.work_dir
            )
        );
        assert!(install_agent_command(&paths).ends_with(" /usr/local/bin/server-clone"));
    }

    #[test]
    fn test_username_is_quoted() {
        let cmd = restore_command(&paths(), "al ice");
        assert!(cmd.contains("--user 'al ice' "));
    }

    #[test]
    fn test_summary_from_report() {
        let json = r#"{
            "records": [
                {"phase": "extract", "subject": "bundle", "status": "done"},
                {"phase": "trees", "subject": "/home/alice", "status": "done"},
                {"phase": "runtimes", "subject": "all", "status": "skipped", "detail": "nothing to install"},
                {"phase": "databases", "subject": "mysql-shop", "status": "failed", "detail": "mysql exited with 1"}
            ],
            "verification": ["Listening ports:", "0.0.0.0:3000"]
        }"#;
        let report: RemoteReport = serde_json::from_str(json).unwrap();
        let summary = RunSummary::from_report(Uuid::new_v4(), Utc::now(), PathBuf::from("/tmp/b.tar"), report);
        assert_eq!(summary.done, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failures, vec!["[databases] mysql-shop: mysql exited with 1".to_string()]);
        assert_eq!(summary.verification.len(), 2);
    }

    #[test]
    fn test_report_without_verification() {
        let report: RemoteReport = serde_json::from_str(r#"{"records": []}"#).unwrap();
        assert!(report.verification.is_empty());
        assert_eq!(report.count("done"), 0);
    }
}
