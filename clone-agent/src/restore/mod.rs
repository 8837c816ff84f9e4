//! Restore reconstructor.
//!
//! Replays a backup bundle onto this host in a fixed order of phases. Each
//! phase only runs when the bundle carries artifacts for it, and every
//! side-effecting step is recorded in the [`RunReport`] instead of aborting
//! the run.

pub mod apps;
pub mod databases;
pub mod detect;
pub mod proxy;
pub mod units;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::BackupMetadata;
use crate::config::{Config, RestoreConfig};
use crate::exec::{Capability, CommandSpec, ExecContext, SystemLayout};
use crate::fs::archive::{extract_tar_gz, list_tar_gz, unpack_bundle};
use crate::inventory::{is_system_unit, Inventory, Pm2Process};
use crate::manifest::{Manifest, ManifestEntry};
use crate::naming::{self, ArtifactKind};
use crate::report::RunReport;
use crate::utils::errors::{CloneError, Result};

use apps::{ensure_user, install_dependencies, read_env_port, resolve_port, UserOutcome};
use databases::DbOutcome;
use detect::{
    default_detectors, detect_all, listings_from_entries, listings_from_tree, AppCapability,
    Runtime, RuntimeDetector,
};
use proxy::{neutralize_tls, ProxyKind};
use units::{ServiceDescriptor, SynthesizedUnit};

pub const RESTORE_DIR_PREFIX: &str = "server-clone-restore-";

const PHASE_EXTRACT: &str = "extract";
const PHASE_RUNTIMES: &str = "runtimes";
const PHASE_USERS: &str = "users";
const PHASE_TREES: &str = "trees";
const PHASE_ENV: &str = "env";
const PHASE_DEPS: &str = "dependencies";
const PHASE_PROXY: &str = "proxy";
const PHASE_DATABASES: &str = "databases";
const PHASE_DOCKER: &str = "docker";
const PHASE_UNITS: &str = "units";
const PHASE_SYNTH: &str = "synthesize";
const PHASE_CRONTABS: &str = "crontabs";
const PHASE_START: &str = "start";
const PHASE_PM2: &str = "pm2";

/// Extract `bundle` into a per-process work directory and restore it.
pub fn restore_bundle(ctx: &mut ExecContext, config: &Config, bundle: &Path) -> Result<RunReport> {
    if !bundle.is_file() {
        return Err(CloneError::FileNotFound(bundle.display().to_string()));
    }

    let extract_dir = config
        .agent
        .work_dir
        .join(format!("{}{}", RESTORE_DIR_PREFIX, std::process::id()));
    info!("Extracting {} into {}", bundle.display(), extract_dir.display());
    unpack_bundle(bundle, &extract_dir)?;

    let result = Reconstructor::new(ctx, &config.restore, &extract_dir).map(|mut r| {
        r.report.done(PHASE_EXTRACT, &bundle.display().to_string());
        r.run()
    });

    if let Err(e) = std::fs::remove_dir_all(&extract_dir) {
        warn!("Failed to remove {}: {}", extract_dir.display(), e);
    }
    result
}

/// Restore state for one extracted bundle.
pub struct Reconstructor<'r, 'a> {
    ctx: &'r mut ExecContext<'a>,
    config: &'r RestoreConfig,
    root: PathBuf,
    manifest: Manifest,
    inventory: Inventory,
    pm2_processes: Vec<Pm2Process>,
    units: Vec<(ServiceDescriptor, String)>,
    detectors: Vec<Box<dyn RuntimeDetector>>,
    /// Apps found in home, PM2 and systemd trees
    apps: Vec<AppCapability>,
    synthesized: Vec<String>,
    report: RunReport,
}

impl<'r, 'a> Reconstructor<'r, 'a> {
    /// Index an already extracted bundle rooted at `root`.
    pub fn new(ctx: &'r mut ExecContext<'a>, config: &'r RestoreConfig, root: &Path) -> Result<Self> {
        ctx.override_apt_packages(&config.apt_packages)?;
        let manifest = Manifest::load_or_index(root)?;
        let mut report = RunReport::new();

        if let Ok(meta) = BackupMetadata::load(root) {
            info!(
                "Restoring backup of {} ({} {}) taken {} by {}",
                meta.source_hostname, meta.os, meta.os_version, meta.backup_date, meta.source_user
            );
        }

        let inventory = match Inventory::load(&root.join(crate::backup::INVENTORY_FILE)) {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("No usable inventory in bundle: {}", e);
                Inventory::default()
            }
        };

        let processes_file = root.join("apps").join(naming::PM2_PROCESSES);
        let mut pm2_processes = Vec::new();
        if processes_file.is_file() {
            let parsed = std::fs::read_to_string(&processes_file)
                .map_err(CloneError::from)
                .and_then(|s| serde_json::from_str::<Vec<Pm2Process>>(&s).map_err(CloneError::from));
            pm2_processes = report.soft(PHASE_PM2, naming::PM2_PROCESSES, parsed).unwrap_or_default();
        }

        let mut units = Vec::new();
        for entry in manifest.of_kind(ArtifactKind::UnitFile) {
            match std::fs::read_to_string(root.join(&entry.archive_path)) {
                Ok(content) => units.push((ServiceDescriptor::parse(&entry.file_name(), &content), content)),
                Err(e) => report.failed(PHASE_UNITS, &entry.file_name(), e),
            }
        }

        Ok(Self {
            detectors: default_detectors(config),
            ctx,
            config,
            root: root.to_path_buf(),
            manifest,
            inventory,
            pm2_processes,
            units,
            apps: Vec::new(),
            synthesized: Vec::new(),
            report,
        })
    }

    /// Run every phase in order and hand back the report.
    pub fn run(mut self) -> RunReport {
        self.detect_runtimes();
        self.restore_trees();
        self.restore_env_files();
        self.install_app_dependencies();
        self.restore_proxies();
        self.restore_databases();
        self.restore_docker();
        self.install_units();
        self.synthesize_units();
        self.restore_crontabs();
        self.start_services();
        self.start_pm2();
        self.verify();
        info!("Restore finished: {}", self.report.to_string().lines().next().unwrap_or(""));
        self.report
    }

    fn artifact(&self, entry: &ManifestEntry) -> PathBuf {
        self.root.join(&entry.archive_path)
    }

    fn entries(&self, kind: ArtifactKind) -> Vec<ManifestEntry> {
        self.manifest.of_kind(kind).cloned().collect()
    }

    fn pm2_cwd(&self, entry: &ManifestEntry) -> Option<PathBuf> {
        entry.original_path.clone().or_else(|| {
            let name = entry.identity.as_deref()?;
            self.pm2_processes
                .iter()
                .map(|p| &p.pm2_env.pm_cwd)
                .find(|cwd| cwd.file_name().map(|n| n == name).unwrap_or(false))
                .cloned()
        })
    }

    /// The unit `WorkingDirectory=` is authoritative, never the archive name.
    fn systemd_working_dir(&self, entry: &ManifestEntry) -> Option<PathBuf> {
        entry.original_path.clone().or_else(|| {
            let name = entry.identity.as_deref()?;
            self.units
                .iter()
                .filter_map(|(u, _)| u.working_dir.as_ref())
                .find(|wd| wd.file_name().map(|n| n == name).unwrap_or(false))
                .cloned()
        })
    }

    /// Logical root of the tree an archive restores.
    fn tree_root(&self, entry: &ManifestEntry) -> Option<PathBuf> {
        match entry.kind {
            ArtifactKind::Home => entry.identity.as_deref().map(SystemLayout::home_of),
            ArtifactKind::Pm2App => self.pm2_cwd(entry),
            ArtifactKind::SystemdApp => self.systemd_working_dir(entry),
            ArtifactKind::NginxRoot | ArtifactKind::ApacheRoot => entry.original_path.clone(),
            _ => None,
        }
    }

    /// Account that should own a restored path.
    fn owner_of(&self, entry: Option<&ManifestEntry>, logical: &Path) -> String {
        entry
            .and_then(|e| e.owner.clone())
            .or_else(|| {
                self.manifest
                    .entries
                    .iter()
                    .find(|e| e.original_path.as_deref() == Some(logical))
                    .and_then(|e| e.owner.clone())
            })
            .or_else(|| {
                self.pm2_processes
                    .iter()
                    .find(|p| p.pm2_env.pm_cwd == logical)
                    .and_then(|p| p.pm2_env.username.clone())
            })
            .or_else(|| SystemLayout::owner_of(logical))
            .unwrap_or_else(|| self.ctx.user.clone())
    }

    fn ensure(&mut self, phase: &str, capability: Capability) -> bool {
        match self.ctx.ensure(capability) {
            Ok(true) => {
                self.report.done(phase, &format!("install {}", capability));
                true
            }
            Ok(false) => true,
            Err(e) => {
                self.report.failed(phase, &format!("install {}", capability), e);
                false
            }
        }
    }

    fn unit_dirs(&self) -> BTreeSet<PathBuf> {
        self.units
            .iter()
            .filter_map(|(u, _)| u.working_dir.clone())
            .collect()
    }

    /// Phase 2: sniff archived trees for app markers and copied units for
    /// runtime keywords, then install exactly those runtimes.
    fn detect_runtimes(&mut self) {
        let mut listings = Vec::new();
        for kind in [ArtifactKind::Home, ArtifactKind::Pm2App, ArtifactKind::SystemdApp] {
            for entry in self.entries(kind) {
                let Some(base) = self.tree_root(&entry).and_then(|r| r.parent().map(Path::to_path_buf)) else {
                    self.report.skipped(PHASE_RUNTIMES, &entry.file_name(), "original location unknown");
                    continue;
                };
                match list_tar_gz(&self.artifact(&entry)) {
                    Ok(members) => listings.extend(listings_from_entries(&members, &base)),
                    Err(e) => self.report.failed(PHASE_RUNTIMES, &entry.file_name(), e),
                }
            }
        }

        let mut seen = BTreeSet::new();
        self.apps = detect_all(&self.detectors, &listings)
            .into_iter()
            .filter(|a| seen.insert((a.runtime, a.dir.clone())))
            .collect();

        // every detector signal counts: a dependency manifest, a shipped
        // venv or a manage.py
        let mut needed: BTreeSet<Runtime> = self.apps.iter().map(|a| a.runtime).collect();
        for (unit, _) in &self.units {
            needed.extend(unit.runtimes.iter().copied());
        }
        if !self.pm2_processes.is_empty() {
            needed.insert(Runtime::Node);
        }

        if needed.is_empty() {
            self.report
                .skipped(PHASE_RUNTIMES, "all", "no dependency manifest or runtime keyword found");
        }
        for runtime in needed {
            self.ensure(PHASE_RUNTIMES, runtime.capability());
        }
    }

    /// Phase 3: recreate users and extract home, PM2 and systemd trees.
    fn restore_trees(&mut self) {
        for entry in self.entries(ArtifactKind::Home) {
            let Some(user) = entry.identity.clone() else {
                continue;
            };
            if !self.ensure_owner(&user) {
                continue;
            }
            self.extract_tree(&entry, &user);
        }

        for kind in [ArtifactKind::Pm2App, ArtifactKind::SystemdApp] {
            for entry in self.entries(kind) {
                let Some(root) = self.tree_root(&entry) else {
                    self.report.skipped(PHASE_TREES, &entry.file_name(), "original location unknown");
                    continue;
                };
                let owner = self.owner_of(Some(&entry), &root);
                if !self.ensure_owner(&owner) {
                    continue;
                }
                self.extract_tree(&entry, &owner);
            }
        }
    }

    fn ensure_owner(&mut self, user: &str) -> bool {
        match ensure_user(self.ctx, user) {
            Ok(UserOutcome::Created) => {
                self.report.done(PHASE_USERS, user);
                true
            }
            Ok(UserOutcome::Existing) => {
                if !self.report.records.iter().any(|r| r.phase == PHASE_USERS && r.subject == user) {
                    self.report.skipped(PHASE_USERS, user, "already exists");
                }
                true
            }
            Err(e) => {
                self.report.failed(PHASE_USERS, user, e);
                false
            }
        }
    }

    /// Extract a tree archive beside its original location and hand it to
    /// `owner`.
    fn extract_tree(&mut self, entry: &ManifestEntry, owner: &str) {
        let Some(root) = self.tree_root(entry) else {
            return;
        };
        let Some(parent) = root.parent() else {
            self.report.skipped(PHASE_TREES, &entry.file_name(), "tree has no parent directory");
            return;
        };
        let archive = self.artifact(entry);
        let physical_parent = self.ctx.layout.resolve(parent);
        let physical_root = self.ctx.layout.resolve(&root);

        let result = extract_tar_gz(&archive, &physical_parent)
            .and_then(|_| self.ctx.chown_recursive(owner, &physical_root));
        self.report.soft(PHASE_TREES, &entry.file_name(), result);
    }

    fn restore_env_files(&mut self) {
        for entry in self.entries(ArtifactKind::EnvFile) {
            let Some(path) = entry.original_path.clone() else {
                self.report.skipped(PHASE_ENV, &entry.file_name(), "original path unknown");
                continue;
            };
            let owner = self.owner_of(Some(&entry), &path);
            let target = self.ctx.layout.resolve(&path);
            let result = copy_into_place(&self.artifact(&entry), &target)
                .and_then(|_| self.ctx.chown_recursive(&owner, &target));
            self.report.soft(PHASE_ENV, &path.display().to_string(), result);
        }
    }

    /// Phase 4: per-directory dependency installs as the owning user. Unit
    /// working directories are left to [`install_units`](Self::install_units).
    fn install_app_dependencies(&mut self) {
        let unit_dirs = self.unit_dirs();
        for app in self.apps.clone() {
            if unit_dirs.contains(&app.dir) {
                continue;
            }
            let subject = app.dir.display().to_string();
            if app.manifest.is_none() {
                self.report.skipped(PHASE_DEPS, &subject, "no dependency manifest");
                continue;
            }
            let owner = self.owner_of(None, &app.dir);
            let physical = self.ctx.layout.resolve(&app.dir);
            let result = install_dependencies(self.ctx, &app, &physical, &owner);
            self.report.soft(PHASE_DEPS, &subject, result);
        }
    }

    /// Phase 5: proxy configs with TLS neutralized where certificates are
    /// missing, then document roots.
    fn restore_proxies(&mut self) {
        for kind in [ProxyKind::Nginx, ProxyKind::Apache] {
            let config_root = self.root.join("configs").join(kind.name());
            let root_kind = match kind {
                ProxyKind::Nginx => ArtifactKind::NginxRoot,
                ProxyKind::Apache => ArtifactKind::ApacheRoot,
            };
            let roots = self.entries(root_kind);
            let has_configs = kind
                .config_dirs()
                .iter()
                .any(|dir| has_files(&config_root.join(dir)));
            if !has_configs && roots.is_empty() {
                continue;
            }
            let capability = match kind {
                ProxyKind::Nginx => Capability::Nginx,
                ProxyKind::Apache => Capability::Apache,
            };
            if !self.ensure(PHASE_PROXY, capability) {
                continue;
            }

            let target_root = self.ctx.layout.proxy_dir(kind.name());
            for dir in kind.config_dirs() {
                let src = config_root.join(dir);
                if src.is_dir() {
                    self.restore_proxy_dir(kind, &src, &target_root.join(dir));
                }
            }

            for entry in roots {
                let Some(root) = entry.original_path.clone() else {
                    continue;
                };
                let owner = self.owner_of(Some(&entry), &root);
                self.extract_tree(&entry, &owner);
            }

            let check = match kind {
                ProxyKind::Nginx => CommandSpec::new("nginx").arg("-t"),
                ProxyKind::Apache => CommandSpec::new("apache2ctl").arg("configtest"),
            };
            let result = self
                .ctx
                .run(check)
                .and_then(|_| self.ctx.run(CommandSpec::new("systemctl").args(["reload", kind.unit()])));
            self.report.soft(PHASE_PROXY, &format!("reload {}", kind.unit()), result);
        }
    }

    fn restore_proxy_dir(&mut self, kind: ProxyKind, src: &Path, dest: &Path) {
        let mut names: Vec<String> = match std::fs::read_dir(src) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                self.report.failed(PHASE_PROXY, &src.display().to_string(), e);
                return;
            }
        };
        names.sort();

        let layout = self.ctx.layout.clone();
        let available = src.parent().map(|p| p.join("sites-available"));
        let is_enabled_dir = src.file_name().map(|n| n == "sites-enabled").unwrap_or(false);

        for name in names {
            let subject = format!("{}/{}", kind.name(), name);
            let target = dest.join(&name);

            let linked = is_enabled_dir
                && available
                    .as_ref()
                    .map(|a| a.join(&name).is_file())
                    .unwrap_or(false);
            if linked {
                let result = link_into_place(&Path::new("../sites-available").join(&name), &target);
                self.report.soft(PHASE_PROXY, &subject, result);
                continue;
            }

            let result = std::fs::read_to_string(src.join(&name))
                .map_err(CloneError::from)
                .and_then(|content| {
                    let rewritten = neutralize_tls(kind, &content, |p| layout.resolve(p).exists());
                    if rewritten.is_some() {
                        warn!("{}: certificate missing, TLS disabled", subject);
                    }
                    std::fs::create_dir_all(dest)?;
                    std::fs::write(&target, rewritten.unwrap_or(content))?;
                    Ok(())
                });
            self.report.soft(PHASE_PROXY, &subject, result);
        }
    }

    /// Phase 6: database dumps, each server installed only when a dump needs it.
    fn restore_databases(&mut self) {
        let mysql = self.entries(ArtifactKind::MysqlDb);
        if !mysql.is_empty() && self.ensure(PHASE_DATABASES, Capability::Mysql) {
            for entry in mysql {
                let Some(name) = entry.identity.clone() else {
                    continue;
                };
                let result = databases::restore_mysql(self.ctx, &name, &self.artifact(&entry));
                self.report.soft(PHASE_DATABASES, &entry.file_name(), result);
            }
        }

        let postgres = self.entries(ArtifactKind::PostgresDb);
        if !postgres.is_empty() && self.ensure(PHASE_DATABASES, Capability::Postgres) {
            for entry in postgres {
                let Some(name) = entry.identity.clone() else {
                    continue;
                };
                let subject = format!("createdb {}", name);
                match databases::create_postgres(self.ctx, &name) {
                    Ok(DbOutcome::Created) => self.report.done(PHASE_DATABASES, &subject),
                    Ok(DbOutcome::Existing) => {
                        self.report.skipped(PHASE_DATABASES, &subject, "already exists")
                    }
                    Err(e) => self.report.failed(PHASE_DATABASES, &subject, e),
                }
                let result = databases::import_postgres(self.ctx, &name, &self.artifact(&entry));
                self.report.soft(PHASE_DATABASES, &entry.file_name(), result);
            }
        }

        let mongo = self.entries(ArtifactKind::MongoDump);
        if !mongo.is_empty() && self.ensure(PHASE_DATABASES, Capability::Mongodb) {
            for entry in mongo {
                let result = databases::restore_mongo(self.ctx, &self.artifact(&entry));
                self.report.soft(PHASE_DATABASES, &entry.file_name(), result);
            }
        }

        let redis = self.entries(ArtifactKind::RedisDump);
        if !redis.is_empty() && self.ensure(PHASE_DATABASES, Capability::Redis) {
            for entry in redis {
                let result = databases::restore_redis(self.ctx, &self.artifact(&entry));
                self.report.soft(PHASE_DATABASES, &entry.file_name(), result);
            }
        }
    }

    fn restore_docker(&mut self) {
        let volumes = self.entries(ArtifactKind::Volume);
        let composes = self.entries(ArtifactKind::ComposeFile);
        if volumes.is_empty() && composes.is_empty() {
            return;
        }
        if !self.ensure(PHASE_DOCKER, Capability::Docker) {
            return;
        }

        for entry in volumes {
            let Some(name) = entry.identity.clone() else {
                continue;
            };
            let data = self.ctx.layout.docker_volume_data(&name);
            let result = self
                .ctx
                .run(CommandSpec::new("docker").args(["volume", "create", name.as_str()]))
                .and_then(|_| extract_tar_gz(&self.artifact(&entry), &data));
            self.report.soft(PHASE_DOCKER, &entry.file_name(), result);
        }

        for entry in composes {
            let Some(path) = entry.original_path.clone() else {
                continue;
            };
            let target = self.ctx.layout.resolve(&path);
            let result = copy_into_place(&self.artifact(&entry), &target).and_then(|_| {
                let mut spec = CommandSpec::new("docker")
                    .args(["compose", "-f"])
                    .path_arg(&target)
                    .args(["up", "-d"]);
                if let Some(dir) = target.parent() {
                    spec = spec.cwd(dir);
                }
                self.ctx.run(spec)
            });
            self.report.soft(PHASE_DOCKER, &path.display().to_string(), result);
        }
    }

    /// Phase 7: copy unit files and install each working directory's
    /// dependencies before the unit is first started.
    fn install_units(&mut self) {
        if self.units.is_empty() {
            return;
        }
        let systemd_dir = self.ctx.layout.systemd_dir();
        if let Err(e) = std::fs::create_dir_all(&systemd_dir) {
            self.report.failed(PHASE_UNITS, &systemd_dir.display().to_string(), e);
            return;
        }

        for (unit, content) in self.units.clone() {
            if is_system_unit(&unit.name, &self.config.extra_system_units) {
                self.report.skipped(PHASE_UNITS, &unit.name, "system unit");
                continue;
            }
            let result = std::fs::write(systemd_dir.join(unit.unit_file_name()), &content)
                .map_err(CloneError::from);
            self.report.soft(PHASE_UNITS, &unit.name, result);

            let Some(wd) = unit.working_dir.clone() else {
                continue;
            };
            let app = self
                .apps
                .iter()
                .find(|a| a.dir == wd && a.manifest.is_some())
                .cloned()
                .or_else(|| {
                    let physical = self.ctx.layout.resolve(&wd);
                    detect_all(&self.detectors, &listings_from_tree(&physical, &wd))
                        .into_iter()
                        .find(|a| a.dir == wd && a.manifest.is_some())
                });
            let Some(app) = app else {
                self.report.skipped(PHASE_DEPS, &unit.name, "no dependency manifest");
                continue;
            };
            if !self.ensure(PHASE_DEPS, app.runtime.capability()) {
                continue;
            }
            let owner = unit.user.clone().unwrap_or_else(|| self.owner_of(None, &wd));
            let physical = self.ctx.layout.resolve(&wd);
            let result = install_dependencies(self.ctx, &app, &physical, &owner);
            self.report.soft(PHASE_DEPS, &unit.name, result);
        }

        self.daemon_reload(PHASE_UNITS);
    }

    /// Phase 8: units for entry points that nothing else starts.
    fn synthesize_units(&mut self) {
        let mut taken = self.unit_dirs();
        taken.extend(self.pm2_processes.iter().map(|p| p.pm2_env.pm_cwd.clone()));

        let mut created = Vec::new();
        for app in self.apps.clone() {
            if app.entry_point.is_none() || !taken.insert(app.dir.clone()) {
                continue;
            }
            let owner = self.owner_of(None, &app.dir);
            let env_port = std::fs::read_to_string(self.ctx.layout.resolve(app.dir.join(".env")))
                .ok()
                .and_then(|c| read_env_port(&c));
            let port = resolve_port(app.default_port, None, env_port);
            let Some(unit) = SynthesizedUnit::for_app(&app, &owner, port) else {
                continue;
            };

            let path = self.ctx.layout.systemd_dir().join(unit.unit_file_name());
            let result = path
                .parent()
                .map(std::fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| std::fs::write(&path, unit.render()))
                .map_err(CloneError::from);
            if self.report.soft(PHASE_SYNTH, &unit.name, result).is_some() {
                created.push(unit.name);
            }
        }
        if created.is_empty() {
            return;
        }

        self.daemon_reload(PHASE_SYNTH);
        for name in &created {
            let result = self.ctx.run(CommandSpec::new("systemctl").args(["enable", name.as_str()]));
            self.report.soft(PHASE_SYNTH, &format!("enable {}", name), result);
        }
        self.synthesized = created;
    }

    fn daemon_reload(&mut self, phase: &str) {
        let result = self.ctx.run(CommandSpec::new("systemctl").arg("daemon-reload"));
        self.report.soft(phase, "daemon-reload", result);
    }

    fn restore_crontabs(&mut self) {
        for entry in self.entries(ArtifactKind::Crontab) {
            let Some(user) = entry.identity.clone() else {
                continue;
            };
            if !self.ctx.user_exists(&user) && user != "root" {
                self.report.skipped(PHASE_CRONTABS, &user, "user does not exist");
                continue;
            }
            let result = self.ctx.run(
                CommandSpec::new("crontab")
                    .args(["-u", user.as_str()])
                    .path_arg(&self.artifact(&entry)),
            );
            self.report.soft(PHASE_CRONTABS, &user, result);
        }
    }

    /// Phase 9: start every non-system unit.
    fn start_services(&mut self) {
        let mut seen = BTreeSet::new();
        let names: Vec<String> = self
            .units
            .iter()
            .map(|(u, _)| u.name.clone())
            .chain(self.synthesized.iter().cloned())
            .chain(
                self.inventory
                    .systemd_services
                    .iter()
                    .map(|s| s.trim_end_matches(".service").to_string()),
            )
            .filter(|n| seen.insert(n.clone()))
            .collect();

        for name in names {
            if is_system_unit(&name, &self.config.extra_system_units) {
                self.report.skipped(PHASE_START, &name, "system unit");
                continue;
            }
            let result = self
                .ctx
                .run(CommandSpec::new("systemctl").args(["enable", "--now", name.as_str()]));
            self.report.soft(PHASE_START, &name, result);
        }
    }

    fn start_pm2(&mut self) {
        if self.pm2_processes.is_empty() || !self.ensure(PHASE_PM2, Capability::Pm2) {
            return;
        }

        let mut owners = BTreeSet::new();
        for process in self.pm2_processes.clone() {
            let cwd = process.pm2_env.pm_cwd.clone();
            let owner = self.owner_of(None, &cwd);
            let physical = self.ctx.layout.resolve(&cwd);
            let env_port = std::fs::read_to_string(physical.join(".env"))
                .ok()
                .and_then(|c| read_env_port(&c));
            let port = (process.port().is_some() || env_port.is_some())
                .then(|| resolve_port(self.config.node_default_port, process.port(), env_port));

            let result = apps::start_pm2_process(self.ctx, &process, &physical, &owner, port);
            if self.report.soft(PHASE_PM2, &process.name, result).is_some() {
                owners.insert(owner);
            }
        }

        for owner in owners {
            let home = SystemLayout::home_of(&owner);
            let result = apps::save_pm2(self.ctx, &owner, &home);
            self.report.soft(PHASE_PM2, &format!("save {}", owner), result);
        }
    }

    /// Phase 10: operator-facing listing of ports and running units.
    fn verify(&mut self) {
        let checks = [
            ("Listening ports", CommandSpec::new("ss").arg("-tlnp")),
            (
                "Running services",
                CommandSpec::new("systemctl").args([
                    "list-units",
                    "--type=service",
                    "--state=running",
                    "--no-pager",
                    "--no-legend",
                ]),
            ),
        ];
        for (title, spec) in checks {
            self.report.verification.push(format!("{}:", title));
            match self.ctx.probe(spec) {
                Some(out) => self
                    .report
                    .verification
                    .extend(out.lines().map(|l| format!("  {}", l))),
                None => self.report.verification.push("  (unavailable)".to_string()),
            }
        }
    }
}

/// Whether `dir` directly holds at least one regular file.
fn has_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .any(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        })
        .unwrap_or(false)
}

fn copy_into_place(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest)?;
    Ok(())
}

fn link_into_place(link_target: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::symlink_metadata(dest).is_ok() {
        std::fs::remove_file(dest)?;
    }
    std::os::unix::fs::symlink(link_target, dest)?;
    Ok(())
}
