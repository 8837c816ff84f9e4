//! Artifact naming scheme.
//!
//! Every backed-up unit becomes one flat file whose name is a pure function
//! of where it came from:
//!
//! | Origin                         | Artifact name                              |
//! |--------------------------------|--------------------------------------------|
//! | home of user `U`               | `home-U.tar.gz`                            |
//! | PM2 app at `P` (basename `A`)  | `pm2-A.tar.gz`                             |
//! | nginx/apache document root `R` | `nginx-root<R, / → _>.tar.gz`              |
//! | systemd working directory `D`  | `systemd-<basename D>.tar.gz`              |
//! | MySQL / Postgres database `N`  | `mysql-N.sql` / `postgres-N.sql`           |
//! | docker volume `N`              | `volume-N.tar.gz`                          |
//! | env file / compose file at `P` | `P, / → _` (compose files: `compose` + it) |
//!
//! Path encodings are only invertible when the original path contains no
//! literal `_`; basename encodings are not invertible at all. Restore
//! therefore reads original paths from the side-car manifest (see
//! [`crate::manifest`]) and only falls back to [`decode`] for bundles that
//! lack one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const TAR_GZ: &str = ".tar.gz";
pub const SQL: &str = ".sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Home,
    Pm2App,
    NginxRoot,
    ApacheRoot,
    SystemdApp,
    MysqlDb,
    PostgresDb,
    MongoDump,
    RedisDump,
    Volume,
    ComposeFile,
    EnvFile,
    UnitFile,
    Crontab,
}

impl ArtifactKind {
    /// Directory inside the bundle holding artifacts of this kind.
    pub fn bundle_dir(&self) -> &'static str {
        match self {
            ArtifactKind::Home
            | ArtifactKind::Pm2App
            | ArtifactKind::NginxRoot
            | ArtifactKind::ApacheRoot
            | ArtifactKind::SystemdApp => "apps",
            ArtifactKind::MysqlDb
            | ArtifactKind::PostgresDb
            | ArtifactKind::MongoDump
            | ArtifactKind::RedisDump => "databases",
            ArtifactKind::Volume | ArtifactKind::ComposeFile => "docker",
            ArtifactKind::EnvFile => "configs/env",
            ArtifactKind::UnitFile => "system/systemd",
            ArtifactKind::Crontab => "system",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Home => "home",
            ArtifactKind::Pm2App => "pm2-app",
            ArtifactKind::NginxRoot => "nginx-root",
            ArtifactKind::ApacheRoot => "apache-root",
            ArtifactKind::SystemdApp => "systemd-app",
            ArtifactKind::MysqlDb => "mysql-db",
            ArtifactKind::PostgresDb => "postgres-db",
            ArtifactKind::MongoDump => "mongo-dump",
            ArtifactKind::RedisDump => "redis-dump",
            ArtifactKind::Volume => "volume",
            ArtifactKind::ComposeFile => "compose-file",
            ArtifactKind::EnvFile => "env-file",
            ArtifactKind::UnitFile => "unit-file",
            ArtifactKind::Crontab => "crontab",
        };
        f.write_str(name)
    }
}

/// What an artifact name decodes back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A user, database, volume or unit name
    Name(String),
    /// Only the basename survived; the full path lives in side-channel metadata
    Basename(String),
    /// A full absolute path
    Path(PathBuf),
}

/// `/var/www/html` → `_var_www_html`
pub fn encode_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "_")
}

/// `_var_www_html` → `/var/www/html`. Lossy for paths with literal `_`.
pub fn decode_path(encoded: &str) -> PathBuf {
    PathBuf::from(encoded.replace('_', "/"))
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

pub fn home(user: &str) -> String {
    format!("home-{}{}", user, TAR_GZ)
}

pub fn pm2_app(cwd: &Path) -> String {
    format!("pm2-{}{}", basename(cwd), TAR_GZ)
}

/// `subsystem` is `nginx` or `apache`.
pub fn proxy_root(subsystem: &str, root: &Path) -> String {
    format!("{}-root{}{}", subsystem, encode_path(root), TAR_GZ)
}

pub fn systemd_app(working_dir: &Path) -> String {
    format!("systemd-{}{}", basename(working_dir), TAR_GZ)
}

pub fn mysql_db(name: &str) -> String {
    format!("mysql-{}{}", name, SQL)
}

pub fn postgres_db(name: &str) -> String {
    format!("postgres-{}{}", name, SQL)
}

pub fn volume(name: &str) -> String {
    format!("volume-{}{}", name, TAR_GZ)
}

pub fn env_file(path: &Path) -> String {
    encode_path(path)
}

pub fn compose_file(path: &Path) -> String {
    format!("compose{}", encode_path(path))
}

pub fn crontab(user: &str) -> String {
    format!("crontab-{}", user)
}

/// `pm2-api.tar.gz`, 2 → `pm2-api-2.tar.gz`. Used when two origins map to
/// the same artifact name; the manifest keeps each one's real origin.
pub fn numbered(file_name: &str, n: usize) -> String {
    let (stem, ext) = match file_name.strip_suffix(TAR_GZ) {
        Some(stem) => (stem, TAR_GZ),
        None => match file_name.rfind('.') {
            Some(dot) if dot > 0 => file_name.split_at(dot),
            _ => (file_name, ""),
        },
    };
    format!("{}-{}{}", stem, n, ext)
}

pub const PM2_PROCESSES: &str = "pm2-processes.json";
pub const MONGO_DUMP: &str = "mongodb.archive";
pub const REDIS_DUMP: &str = "redis-dump.rdb";

/// Reverse an artifact file name (without its bundle directory).
///
/// `in_env_dir` disambiguates env files, which carry no prefix of their own.
pub fn decode(file_name: &str, in_env_dir: bool) -> Option<(ArtifactKind, Origin)> {
    if in_env_dir {
        return file_name
            .starts_with('_')
            .then(|| (ArtifactKind::EnvFile, Origin::Path(decode_path(file_name))));
    }

    match file_name {
        MONGO_DUMP => return Some((ArtifactKind::MongoDump, Origin::Name("mongodb".into()))),
        REDIS_DUMP => return Some((ArtifactKind::RedisDump, Origin::Name("redis".into()))),
        _ => {}
    }

    if let Some(stem) = file_name.strip_suffix(SQL) {
        if let Some(db) = stem.strip_prefix("mysql-") {
            return Some((ArtifactKind::MysqlDb, Origin::Name(db.into())));
        }
        if let Some(db) = stem.strip_prefix("postgres-") {
            return Some((ArtifactKind::PostgresDb, Origin::Name(db.into())));
        }
        return None;
    }

    if let Some(encoded) = file_name.strip_prefix("compose") {
        if encoded.starts_with('_') {
            return Some((ArtifactKind::ComposeFile, Origin::Path(decode_path(encoded))));
        }
    }

    if let Some(unit) = file_name.strip_suffix(".service") {
        return Some((ArtifactKind::UnitFile, Origin::Name(unit.into())));
    }

    if let Some(user) = file_name.strip_prefix("crontab-") {
        return Some((ArtifactKind::Crontab, Origin::Name(user.into())));
    }

    let stem = file_name.strip_suffix(TAR_GZ)?;
    if let Some(user) = stem.strip_prefix("home-") {
        return Some((ArtifactKind::Home, Origin::Name(user.into())));
    }
    if let Some(app) = stem.strip_prefix("pm2-") {
        return Some((ArtifactKind::Pm2App, Origin::Basename(app.into())));
    }
    if let Some(encoded) = stem.strip_prefix("nginx-root") {
        return Some((ArtifactKind::NginxRoot, Origin::Path(decode_path(encoded))));
    }
    if let Some(encoded) = stem.strip_prefix("apache-root") {
        return Some((ArtifactKind::ApacheRoot, Origin::Path(decode_path(encoded))));
    }
    if let Some(dir) = stem.strip_prefix("systemd-") {
        return Some((ArtifactKind::SystemdApp, Origin::Basename(dir.into())));
    }
    if let Some(name) = stem.strip_prefix("volume-") {
        return Some((ArtifactKind::Volume, Origin::Name(name.into())));
    }
    None
}
