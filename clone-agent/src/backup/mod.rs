//! Backup assembler.
//!
//! Walks every subsystem the inventory reports, writes one artifact per
//! logical unit into a staging directory, records each in the side-car
//! manifest and bundles the lot into a single compressed archive. A failing
//! subsystem is recorded and skipped; the bundle holds whatever succeeded.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::exec::{CommandSpec, ExecContext, SystemLayout};
use crate::fs::archive::{create_tar_gz, create_tar_gz_with, pack_bundle, BundleFormat};
use crate::fs::walker::WalkOptions;
use crate::inventory::{is_system_unit, Inventory};
use crate::manifest::{Manifest, ManifestEntry};
use crate::naming::{self, ArtifactKind};
use crate::report::RunReport;
use crate::restore::proxy::{document_roots, ProxyKind};
use crate::restore::units::ServiceDescriptor;
use crate::utils::errors::{CloneError, Result};

pub const STAGING_DIR_PREFIX: &str = "server-clone-backup-";
pub const METADATA_FILE: &str = "metadata.json";
pub const INVENTORY_FILE: &str = "inventory.json";

const STAGING_DIRS: &[&str] = &[
    "apps",
    "databases",
    "docker",
    "configs/env",
    "system/systemd",
];

/// Provenance of a bundle, written once at backup time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupMetadata {
    /// RFC 3339 timestamp
    pub backup_date: String,
    pub source_hostname: String,
    pub source_user: String,
    pub os: String,
    pub os_version: String,
}

impl BackupMetadata {
    pub fn load(bundle_root: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(bundle_root.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// A finished backup.
#[derive(Debug)]
pub struct BackupOutcome {
    pub bundle: PathBuf,
    pub report: RunReport,
}

/// Back up everything `inventory` lists. `output` overrides the bundle
/// location (a directory receives the default file name).
pub fn backup(
    ctx: &ExecContext,
    config: &Config,
    inventory: &Inventory,
    output: Option<&Path>,
) -> Result<BackupOutcome> {
    let format = BundleFormat::from_name(&config.bundle.compression)?;
    let staging = config
        .agent
        .work_dir
        .join(format!("{}{}", STAGING_DIR_PREFIX, std::process::id()));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    for dir in STAGING_DIRS {
        std::fs::create_dir_all(staging.join(dir))?;
    }
    info!("Staging backup in {}", staging.display());

    let mut assembler = Assembler {
        ctx,
        config,
        inventory,
        staging: staging.clone(),
        manifest: Manifest::new(),
        report: RunReport::new(),
        homes: Vec::new(),
    };
    assembler.run()?;
    let Assembler { report, .. } = assembler;

    let host = if inventory.system.hostname.is_empty() {
        ctx.hostname.as_str()
    } else {
        inventory.system.hostname.as_str()
    };
    let file_name = format!(
        "server-backup-{}-{}{}",
        host,
        Local::now().format("%Y%m%d-%H%M%S"),
        format.extension()
    );
    let bundle = match output {
        Some(path) if path.is_dir() => path.join(&file_name),
        Some(path) => path.to_path_buf(),
        None => config.bundle.output_dir.join(&file_name),
    };

    info!("Bundling into {}", bundle.display());
    let packed = pack_bundle(&staging, &bundle, format, config.bundle.compression_level);
    if let Err(e) = std::fs::remove_dir_all(&staging) {
        warn!("Failed to remove {}: {}", staging.display(), e);
    }
    packed?;

    Ok(BackupOutcome { bundle, report })
}

struct Assembler<'c, 'a> {
    ctx: &'c ExecContext<'a>,
    config: &'c Config,
    inventory: &'c Inventory,
    staging: PathBuf,
    manifest: Manifest,
    report: RunReport,
    /// Logical home directories already archived
    homes: Vec<PathBuf>,
}

impl<'c, 'a> Assembler<'c, 'a> {
    fn run(&mut self) -> Result<()> {
        self.homes();
        self.pm2();
        self.systemd();
        self.proxies();
        self.databases();
        self.docker();
        self.env_files();
        self.system_files();

        let metadata = BackupMetadata {
            backup_date: Utc::now().to_rfc3339(),
            source_hostname: if self.inventory.system.hostname.is_empty() {
                self.ctx.hostname.clone()
            } else {
                self.inventory.system.hostname.clone()
            },
            source_user: self.ctx.user.clone(),
            os: self.inventory.system.os.clone(),
            os_version: self.inventory.system.version.clone(),
        };
        std::fs::write(
            self.staging.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        self.inventory.save(&self.staging.join(INVENTORY_FILE))?;
        self.manifest.write(&self.staging)?;

        info!(
            "Backup assembled: {} artifacts, {} failed",
            self.manifest.entries.len(),
            self.report.failures().count()
        );
        Ok(())
    }

    fn layout(&self) -> &SystemLayout {
        &self.ctx.layout
    }

    fn dest(&self, kind: ArtifactKind, file_name: &str) -> (PathBuf, PathBuf) {
        let relative = Path::new(kind.bundle_dir()).join(file_name);
        (self.staging.join(&relative), relative)
    }

    /// Bundle-relative path for a tree archive. Origins sharing a name
    /// (`/home/alice/api` and `/home/bob/api`) get numbered suffixes.
    fn unique_archive(&self, kind: ArtifactKind, file_name: &str) -> PathBuf {
        let (_, mut relative) = self.dest(kind, file_name);
        let mut n = 2;
        while self.claimed(&relative) {
            relative = self.dest(kind, &naming::numbered(file_name, n)).1;
            n += 1;
        }
        relative
    }

    fn claimed(&self, relative: &Path) -> bool {
        self.manifest.entries.iter().any(|e| e.archive_path == relative)
            || self.staging.join(relative).exists()
    }

    /// Archive a directory tree as `<basename>/...` and record it.
    fn archive_tree(&mut self, phase: &str, entry: ManifestEntry, logical: &Path, prefix: &str) -> bool {
        let src = self.layout().resolve(logical);
        let dest = self.staging.join(&entry.archive_path);
        match create_tar_gz(&src, Path::new(prefix), &dest) {
            Ok(stats) => {
                self.report.done(
                    phase,
                    &format!("{} ({} entries, {} bytes)", entry.file_name(), stats.entries, stats.bytes),
                );
                self.manifest.push(entry);
                true
            }
            Err(e) => {
                self.report.failed(phase, &entry.file_name(), e);
                let _ = std::fs::remove_file(&dest);
                false
            }
        }
    }

    fn homes(&mut self) {
        let users: Vec<String> = if self.inventory.users.is_empty() {
            vec![self.ctx.user.clone()]
        } else {
            self.inventory.users.clone()
        };

        for user in users {
            let home = SystemLayout::home_of(&user);
            if !self.layout().resolve(&home).is_dir() {
                self.report.skipped("homes", &user, "no home directory");
                continue;
            }
            let (_, relative) = self.dest(ArtifactKind::Home, &naming::home(&user));
            let entry = ManifestEntry::new(ArtifactKind::Home, relative)
                .original_path(&home)
                .identity(&user)
                .owner(&user);
            if self.archive_tree("homes", entry, &home, &user) {
                self.homes.push(home);
            }
        }
    }

    fn pm2(&mut self) {
        let processes = &self.inventory.pm2.processes;
        if !self.inventory.pm2.installed || processes.is_empty() {
            return;
        }

        let (list_path, _) = self.dest(ArtifactKind::Pm2App, naming::PM2_PROCESSES);
        let written = serde_json::to_string_pretty(processes)
            .map_err(CloneError::from)
            .and_then(|json| std::fs::write(&list_path, json).map_err(CloneError::from));
        self.report.soft("pm2", naming::PM2_PROCESSES, written);

        let mut seen = BTreeSet::new();
        for process in processes {
            let cwd = process.pm2_env.pm_cwd.clone();
            if !seen.insert(cwd.clone()) {
                continue;
            }
            if !self.layout().resolve(&cwd).is_dir() {
                self.report.skipped("pm2", &process.name, "working directory missing");
                continue;
            }
            let prefix = basename(&cwd);
            let owner = process
                .pm2_env
                .username
                .clone()
                .or_else(|| SystemLayout::owner_of(&cwd))
                .unwrap_or_else(|| self.ctx.user.clone());
            let relative = self.unique_archive(ArtifactKind::Pm2App, &naming::pm2_app(&cwd));
            let entry = ManifestEntry::new(ArtifactKind::Pm2App, relative)
                .original_path(&cwd)
                .identity(&prefix)
                .owner(owner);
            self.archive_tree("pm2", entry, &cwd, &prefix);
        }
    }

    fn systemd(&mut self) {
        let extra = &self.config.restore.extra_system_units;
        for service in &self.inventory.systemd_services {
            let name = service.trim_end_matches(".service");
            if is_system_unit(name, extra) {
                continue;
            }
            let file_name = format!("{}.service", name);
            let logical = Path::new("/etc/systemd/system").join(&file_name);
            let unit_path = self.layout().resolve(&logical);
            if !unit_path.is_file() {
                self.report.skipped("systemd", name, "unit file not under /etc/systemd/system");
                continue;
            }

            let content = match std::fs::read_to_string(&unit_path) {
                Ok(content) => content,
                Err(e) => {
                    self.report.failed("systemd", name, e);
                    continue;
                }
            };
            let (dest, relative) = self.dest(ArtifactKind::UnitFile, &file_name);
            let copied = std::fs::write(&dest, &content).map_err(CloneError::from);
            if self.report.soft("systemd", &file_name, copied).is_none() {
                continue;
            }
            self.manifest.push(
                ManifestEntry::new(ArtifactKind::UnitFile, relative)
                    .original_path(&logical)
                    .identity(name),
            );

            let unit = ServiceDescriptor::parse(name, &content);
            let Some(wd) = unit.working_dir else {
                continue;
            };
            if self.homes.iter().any(|h| wd.starts_with(h)) {
                continue;
            }
            if !self.layout().resolve(&wd).is_dir() {
                self.report.skipped("systemd", &wd.display().to_string(), "working directory missing");
                continue;
            }
            let prefix = basename(&wd);
            let owner = unit
                .user
                .or_else(|| SystemLayout::owner_of(&wd))
                .or_else(|| path_owner(&self.layout().resolve(&wd)))
                .unwrap_or_else(|| "root".to_string());
            let relative = self.unique_archive(ArtifactKind::SystemdApp, &naming::systemd_app(&wd));
            let entry = ManifestEntry::new(ArtifactKind::SystemdApp, relative)
                .original_path(&wd)
                .identity(&prefix)
                .owner(owner);
            self.archive_tree("systemd", entry, &wd, &prefix);
        }
    }

    fn proxies(&mut self) {
        for kind in [ProxyKind::Nginx, ProxyKind::Apache] {
            let info = match kind {
                ProxyKind::Nginx => &self.inventory.nginx,
                ProxyKind::Apache => &self.inventory.apache,
            };
            if !info.running {
                continue;
            }
            let phase = kind.name();
            let config_root = self.layout().proxy_dir(kind.name());
            let mut roots = BTreeSet::new();

            for dir in kind.config_dirs() {
                let src = config_root.join(dir);
                let Ok(read_dir) = std::fs::read_dir(&src) else {
                    continue;
                };
                let dest_dir = self.staging.join("configs").join(kind.name()).join(dir);
                for entry in read_dir.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    // follows sites-enabled symlinks to their content
                    let Ok(content) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    roots.extend(document_roots(kind, &content));
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let copied = std::fs::create_dir_all(&dest_dir)
                        .and_then(|_| std::fs::write(dest_dir.join(&name), &content))
                        .map_err(CloneError::from);
                    self.report.soft(phase, &format!("{}/{}", dir, name), copied);
                }
            }

            let root_kind = match kind {
                ProxyKind::Nginx => ArtifactKind::NginxRoot,
                ProxyKind::Apache => ArtifactKind::ApacheRoot,
            };
            for root in roots {
                if !self.layout().resolve(&root).is_dir() {
                    self.report.skipped(phase, &root.display().to_string(), "document root missing");
                    continue;
                }
                let owner = SystemLayout::owner_of(&root)
                    .or_else(|| path_owner(&self.layout().resolve(&root)));
                let relative = self.unique_archive(root_kind, &naming::proxy_root(kind.name(), &root));
                let mut entry = ManifestEntry::new(root_kind, relative).original_path(&root);
                if let Some(owner) = owner {
                    entry = entry.owner(owner);
                }
                self.archive_tree(phase, entry, &root, &basename(&root));
            }
        }
    }

    /// Run a dump command into `file_name`, discarding the partial file on failure.
    fn dump(&mut self, kind: ArtifactKind, identity: &str, file_name: &str, spec: CommandSpec) {
        let (dest, relative) = self.dest(kind, file_name);
        let result = self.ctx.run(spec.stdout_to(&dest));
        if self.report.soft("databases", file_name, result).is_some() {
            self.manifest
                .push(ManifestEntry::new(kind, relative).identity(identity));
        } else {
            let _ = std::fs::remove_file(&dest);
        }
    }

    fn databases(&mut self) {
        let dbs = &self.inventory.databases;

        if dbs.mysql.running {
            for db in &dbs.mysql.databases {
                self.dump(
                    ArtifactKind::MysqlDb,
                    db,
                    &naming::mysql_db(db),
                    CommandSpec::new("mysqldump").args(["--single-transaction", "--routines", db.as_str()]),
                );
            }
        }

        if dbs.postgres.running {
            for db in &dbs.postgres.databases {
                self.dump(
                    ArtifactKind::PostgresDb,
                    db,
                    &naming::postgres_db(db),
                    CommandSpec::new("pg_dump").as_user("postgres").arg(db.as_str()),
                );
            }
        }

        if dbs.mongodb.running {
            let (dest, relative) = self.dest(ArtifactKind::MongoDump, naming::MONGO_DUMP);
            let result = self.ctx.run(
                CommandSpec::new("mongodump").arg(format!("--archive={}", dest.display())),
            );
            if self.report.soft("databases", naming::MONGO_DUMP, result).is_some() {
                self.manifest
                    .push(ManifestEntry::new(ArtifactKind::MongoDump, relative).identity("mongodb"));
            }
        }

        if dbs.redis.running {
            let (dest, relative) = self.dest(ArtifactKind::RedisDump, naming::REDIS_DUMP);
            let source = self.layout().redis_dump();
            let result = self
                .ctx
                .run(CommandSpec::new("redis-cli").arg("SAVE"))
                .and_then(|_| std::fs::copy(&source, &dest).map_err(CloneError::from));
            if self.report.soft("databases", naming::REDIS_DUMP, result).is_some() {
                self.manifest
                    .push(ManifestEntry::new(ArtifactKind::RedisDump, relative).identity("redis"));
            }
        }
    }

    fn docker(&mut self) {
        let docker = &self.inventory.docker;
        if !docker.installed {
            return;
        }

        for volume in &docker.volumes {
            let data = self.layout().docker_volume_data(volume);
            let (dest, relative) = self.dest(ArtifactKind::Volume, &naming::volume(volume));
            let options = WalkOptions {
                exclude_patterns: Vec::new(),
                ..Default::default()
            };
            let result = create_tar_gz_with(&data, Path::new(""), &dest, options);
            if self.report.soft("docker", &naming::volume(volume), result).is_some() {
                self.manifest
                    .push(ManifestEntry::new(ArtifactKind::Volume, relative).identity(volume));
            }
        }

        for compose in &docker.compose_files {
            let name = naming::compose_file(compose);
            let (dest, relative) = self.dest(ArtifactKind::ComposeFile, &name);
            let result = std::fs::copy(self.layout().resolve(compose), &dest).map_err(CloneError::from);
            if self.report.soft("docker", &compose.display().to_string(), result).is_some() {
                let mut entry = ManifestEntry::new(ArtifactKind::ComposeFile, relative).original_path(compose);
                if let Some(owner) = SystemLayout::owner_of(compose) {
                    entry = entry.owner(owner);
                }
                self.manifest.push(entry);
            }
        }
    }

    fn env_files(&mut self) {
        for path in &self.inventory.env_files {
            let (dest, relative) = self.dest(ArtifactKind::EnvFile, &naming::env_file(path));
            let result = std::fs::copy(self.layout().resolve(path), &dest).map_err(CloneError::from);
            if self.report.soft("env", &path.display().to_string(), result).is_some() {
                let mut entry = ManifestEntry::new(ArtifactKind::EnvFile, relative).original_path(path);
                if let Some(owner) = SystemLayout::owner_of(path) {
                    entry = entry.owner(owner);
                }
                self.manifest.push(entry);
            }
        }
    }

    fn system_files(&mut self) {
        for (user, lines) in &self.inventory.crontabs {
            if lines.is_empty() {
                continue;
            }
            let name = naming::crontab(user);
            let (dest, relative) = self.dest(ArtifactKind::Crontab, &name);
            let result = std::fs::write(&dest, format!("{}\n", lines.join("\n"))).map_err(CloneError::from);
            if self.report.soft("system", &name, result).is_some() {
                self.manifest
                    .push(ManifestEntry::new(ArtifactKind::Crontab, relative).identity(user));
            }
        }

        let os_release = self.layout().os_release();
        if os_release.is_file() {
            let result = std::fs::copy(&os_release, self.staging.join("system/os-release"))
                .map_err(CloneError::from);
            self.report.soft("system", "os-release", result);
        }

        let apt = self.ctx.run(
            CommandSpec::new("dpkg")
                .arg("--get-selections")
                .stdout_to(self.staging.join("system/packages-apt.txt")),
        );
        self.report.soft("system", "packages-apt.txt", apt);

        if self.ctx.has_binary("npm") {
            let npm = self.ctx.run(
                CommandSpec::new("npm")
                    .args(["ls", "-g", "--depth=0"])
                    .stdout_to(self.staging.join("system/packages-npm-global.txt")),
            );
            self.report.soft("system", "packages-npm-global.txt", npm);
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// Name of the account owning `path` on this host.
fn path_owner(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let uid = std::fs::metadata(path).ok()?.uid();
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::fs::archive::{list_tar_gz, unpack_bundle};
    use crate::inventory::{Pm2Env, Pm2Process};
    use std::fs;
    use tempfile::TempDir;

    struct Host {
        dir: TempDir,
    }

    impl Host {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            fs::create_dir_all(dir.path().join("root"))?;
            fs::create_dir_all(dir.path().join("work"))?;
            fs::create_dir_all(dir.path().join("out"))?;
            Ok(Self { dir })
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("root")
        }

        fn write(&self, logical: &str, content: &str) -> Result<()> {
            let path = SystemLayout::new(self.root()).resolve(logical);
            fs::create_dir_all(path.parent().expect("parent"))?;
            fs::write(path, content)?;
            Ok(())
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.agent.work_dir = self.dir.path().join("work");
            config.bundle.output_dir = self.dir.path().join("out");
            config
        }

        /// Back up and unpack the resulting bundle for inspection.
        fn backup(&self, runner: &FakeRunner, inventory: &Inventory) -> Result<(PathBuf, RunReport)> {
            let ctx = ExecContext::new(runner, SystemLayout::new(self.root()), "alice");
            let outcome = backup(&ctx, &self.config(), inventory, None)?;
            let unpacked = self.dir.path().join("unpacked");
            unpack_bundle(&outcome.bundle, &unpacked)?;
            Ok((unpacked, outcome.report))
        }
    }

    fn pm2_inventory() -> Inventory {
        let mut inventory = Inventory::default();
        inventory.users = vec!["alice".into()];
        inventory.pm2.installed = true;
        inventory.pm2.processes = vec![Pm2Process {
            name: "app".into(),
            pm2_env: Pm2Env {
                pm_cwd: "/home/alice/app".into(),
                pm_exec_path: "/home/alice/app/server.js".into(),
                username: Some("alice".into()),
                ..Default::default()
            },
        }];
        inventory
    }

    #[test]
    fn test_pm2_app_backed_up_with_process_list() -> Result<()> {
        let host = Host::new()?;
        host.write("/home/alice/app/package.json", "{}")?;
        host.write("/home/alice/app/server.js", "listen()")?;
        host.write("/home/alice/app/node_modules/express/index.js", "x")?;

        let (bundle, report) = host.backup(&FakeRunner::new(), &pm2_inventory())?;

        let archive = bundle.join("apps/pm2-app.tar.gz");
        let members = list_tar_gz(&archive)?;
        assert!(members.iter().any(|m| m.path == Path::new("app/package.json")));
        assert!(members.iter().all(|m| !m.path.to_string_lossy().contains("node_modules")));

        let list = fs::read_to_string(bundle.join("apps/pm2-processes.json"))?;
        assert!(list.contains("/home/alice/app"));

        let manifest = Manifest::load_or_index(&bundle)?;
        let entry = manifest.of_kind(ArtifactKind::Pm2App).next().expect("pm2 entry");
        assert_eq!(entry.original_path.as_deref(), Some(Path::new("/home/alice/app")));
        assert_eq!(entry.owner.as_deref(), Some("alice"));
        assert!(manifest.has_kind(ArtifactKind::Home));

        let metadata = BackupMetadata::load(&bundle)?;
        assert_eq!(metadata.source_user, "alice");
        assert!(bundle.join(INVENTORY_FILE).is_file());
        assert_eq!(report.failures().count(), 0, "{}", report);
        Ok(())
    }

    #[test]
    fn test_same_named_app_dirs_get_distinct_archives() -> Result<()> {
        let host = Host::new()?;
        host.write("/home/alice/api/server.js", "// alice")?;
        host.write("/home/bob/api/server.js", "// bob")?;
        let mut inventory = pm2_inventory();
        inventory.pm2.processes = ["alice", "bob"]
            .iter()
            .map(|user| Pm2Process {
                name: format!("{}-api", user),
                pm2_env: Pm2Env {
                    pm_cwd: format!("/home/{}/api", user).into(),
                    pm_exec_path: format!("/home/{}/api/server.js", user).into(),
                    username: Some(user.to_string()),
                    ..Default::default()
                },
            })
            .collect();

        let (bundle, report) = host.backup(&FakeRunner::new(), &inventory)?;

        let manifest = Manifest::load_or_index(&bundle)?;
        let apps: Vec<_> = manifest.of_kind(ArtifactKind::Pm2App).collect();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].archive_path, Path::new("apps/pm2-api.tar.gz"));
        assert_eq!(apps[0].original_path.as_deref(), Some(Path::new("/home/alice/api")));
        assert_eq!(apps[1].archive_path, Path::new("apps/pm2-api-2.tar.gz"));
        assert_eq!(apps[1].original_path.as_deref(), Some(Path::new("/home/bob/api")));
        for app in apps {
            assert!(bundle.join(&app.archive_path).is_file());
        }
        assert_eq!(report.failures().count(), 0, "{}", report);
        Ok(())
    }

    #[test]
    fn test_failed_dump_does_not_stop_backup() -> Result<()> {
        let host = Host::new()?;
        host.write("/home/alice/.bashrc", "x")?;
        let mut inventory = pm2_inventory();
        inventory.pm2 = Default::default();
        inventory.databases.mysql.running = true;
        inventory.databases.mysql.databases = vec!["shop".into()];
        inventory.databases.postgres.running = true;
        inventory.databases.postgres.databases = vec!["shop".into()];

        let runner = FakeRunner::new()
            .fail("mysqldump", "Access denied")
            .respond("pg_dump", "CREATE TABLE orders ();");
        let (bundle, report) = host.backup(&runner, &inventory)?;

        assert_eq!(report.failures().count(), 1);
        assert!(!bundle.join("databases/mysql-shop.sql").exists());
        assert_eq!(
            fs::read_to_string(bundle.join("databases/postgres-shop.sql"))?,
            "CREATE TABLE orders ();"
        );
        assert!(bundle.join("apps/home-alice.tar.gz").is_file());
        assert!(runner.ran("sudo -u postgres -H -- pg_dump shop"));

        let manifest = Manifest::load_or_index(&bundle)?;
        assert!(!manifest.has_kind(ArtifactKind::MysqlDb));
        assert!(manifest.has_kind(ArtifactKind::PostgresDb));
        Ok(())
    }

    #[test]
    fn test_unit_and_working_dir_backed_up() -> Result<()> {
        let host = Host::new()?;
        host.write(
            "/etc/systemd/system/api.service",
            "[Service]\nUser=www-data\nWorkingDirectory=/opt/api\nExecStart=/usr/bin/node server.js\n",
        )?;
        host.write("/etc/systemd/system/ssh.service", "[Service]\nExecStart=/usr/sbin/sshd\n")?;
        host.write("/opt/api/server.js", "listen()")?;
        let mut inventory = Inventory::default();
        inventory.systemd_services = vec!["api.service".into(), "ssh.service".into()];

        let (bundle, _) = host.backup(&FakeRunner::new(), &inventory)?;

        assert!(bundle.join("system/systemd/api.service").is_file());
        assert!(!bundle.join("system/systemd/ssh.service").exists());
        let members = list_tar_gz(&bundle.join("apps/systemd-api.tar.gz"))?;
        assert!(members.iter().any(|m| m.path == Path::new("api/server.js")));

        let manifest = Manifest::load_or_index(&bundle)?;
        let app = manifest.of_kind(ArtifactKind::SystemdApp).next().expect("systemd app");
        assert_eq!(app.original_path.as_deref(), Some(Path::new("/opt/api")));
        assert_eq!(app.owner.as_deref(), Some("www-data"));
        Ok(())
    }

    #[test]
    fn test_proxy_configs_and_document_roots() -> Result<()> {
        let host = Host::new()?;
        host.write(
            "/etc/nginx/sites-available/my_site",
            "server {\n    listen 80;\n    root /var/www/my_site;\n}\n",
        )?;
        host.write("/var/www/my_site/index.html", "<h1>hi</h1>")?;
        let mut inventory = Inventory::default();
        inventory.nginx.running = true;

        let (bundle, _) = host.backup(&FakeRunner::new(), &inventory)?;

        assert!(bundle.join("configs/nginx/sites-available/my_site").is_file());
        assert!(bundle.join("apps/nginx-root_var_www_my_site.tar.gz").is_file());
        let manifest = Manifest::load_or_index(&bundle)?;
        let root = manifest.of_kind(ArtifactKind::NginxRoot).next().expect("root");
        // the manifest keeps the path the file name cannot
        assert_eq!(root.original_path.as_deref(), Some(Path::new("/var/www/my_site")));
        Ok(())
    }

    #[test]
    fn test_env_files_and_crontabs() -> Result<()> {
        let host = Host::new()?;
        host.write("/home/alice/app/.env", "PORT=4000\n")?;
        let mut inventory = Inventory::default();
        inventory.env_files = vec!["/home/alice/app/.env".into()];
        inventory
            .crontabs
            .insert("alice".into(), vec!["*/5 * * * * /home/alice/bin/sync".into()]);

        let (bundle, _) = host.backup(&FakeRunner::new(), &inventory)?;

        assert_eq!(
            fs::read_to_string(bundle.join("configs/env/_home_alice_app_.env"))?,
            "PORT=4000\n"
        );
        assert_eq!(
            fs::read_to_string(bundle.join("system/crontab-alice"))?,
            "*/5 * * * * /home/alice/bin/sync\n"
        );
        Ok(())
    }

    #[test]
    fn test_bundle_name_and_staging_cleanup() -> Result<()> {
        let host = Host::new()?;
        let mut inventory = Inventory::default();
        inventory.system.hostname = "web1".into();
        let runner = FakeRunner::new();
        let ctx = ExecContext::new(&runner, SystemLayout::new(host.root()), "alice");
        let mut config = host.config();
        config.bundle.compression = "zstd".into();

        let outcome = backup(&ctx, &config, &inventory, None)?;
        let name = outcome.bundle.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("server-backup-web1-"));
        assert!(name.ends_with(".tar.zst"));
        assert_eq!(fs::read_dir(&config.agent.work_dir)?.count(), 0);
        Ok(())
    }
}
