//! Detection probes.
//!
//! Each probe shells out to the subsystem's own tooling. A probe that fails
//! in any way degrades to the empty/false value; `scan` itself cannot fail.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{
    is_system_unit, DbServer, DockerInfo, Inventory, Pm2Env, Pm2Info, Pm2Process, ProxyInfo,
    SystemInfo, MONGO_SYSTEM_DATABASES, MYSQL_SYSTEM_DATABASES, POSTGRES_SYSTEM_DATABASES,
};
use crate::exec::{CommandSpec, ExecContext, SystemLayout};
use crate::fs::walker::find_files;

const COMPOSE_NAMES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
const COMPOSE_ROOTS: &[&str] = &["/home", "/opt", "/srv"];
const ENV_ROOTS: &[&str] = &["/home", "/opt", "/srv", "/var/www"];

/// Take a snapshot of the host.
pub fn scan(ctx: &ExecContext) -> Inventory {
    info!("Scanning {}", ctx.hostname);

    let users = probe_users(ctx);
    let mut inventory = Inventory {
        docker: probe_docker(ctx),
        pm2: probe_pm2(ctx, &users),
        nginx: probe_proxy(ctx, "nginx", "nginx", "nginx"),
        apache: probe_proxy(ctx, "apache", "apache2", "apache2"),
        systemd_services: probe_services(ctx),
        ports: probe_ports(ctx),
        env_files: probe_env_files(ctx),
        crontabs: probe_crontabs(ctx, &users),
        system: probe_system(ctx),
        users,
        ..Default::default()
    };

    inventory.databases.mysql = probe_mysql(ctx);
    inventory.databases.postgres = probe_postgres(ctx);
    inventory.databases.mongodb = probe_mongodb(ctx);
    inventory.databases.redis = probe_redis(ctx);

    info!(
        "Scan complete: {} services, {} users, {} pm2 processes, {} ports",
        inventory.systemd_services.len(),
        inventory.users.len(),
        inventory.pm2.processes.len(),
        inventory.ports.len()
    );
    inventory
}

fn probe_docker(ctx: &ExecContext) -> DockerInfo {
    if !ctx.has_binary("docker") {
        return DockerInfo::default();
    }
    let mut info = DockerInfo {
        installed: true,
        ..Default::default()
    };
    if ctx.unit_active("docker") {
        info.containers = lines_of(ctx, CommandSpec::new("docker").args(["ps", "-a", "--format", "{{.Names}}"]));
        info.volumes = lines_of(ctx, CommandSpec::new("docker").args(["volume", "ls", "-q"]));
    }
    for root in COMPOSE_ROOTS {
        for path in find_files(&ctx.layout.resolve(root), 4, |n| COMPOSE_NAMES.contains(&n)) {
            info.compose_files.push(ctx.layout.logical(&path));
        }
    }
    info
}

fn probe_pm2(ctx: &ExecContext, users: &[String]) -> Pm2Info {
    if !ctx.has_binary("pm2") {
        return Pm2Info::default();
    }

    let mut processes = Vec::new();
    let owners = std::iter::once("root".to_string()).chain(users.iter().cloned());
    let mut probed_any = false;
    for owner in owners {
        let pm2_home = ctx.layout.resolve(SystemLayout::home_of(&owner)).join(".pm2");
        if !pm2_home.is_dir() {
            continue;
        }
        probed_any = true;
        let mut spec = CommandSpec::new("pm2").arg("jlist");
        if owner != "root" {
            spec = spec.as_user(owner.clone());
        }
        if let Some(out) = ctx.probe(spec) {
            processes.extend(parse_pm2_jlist(&out.stdout, &owner));
        }
    }
    if !probed_any {
        if let Some(out) = ctx.probe(CommandSpec::new("pm2").arg("jlist")) {
            processes.extend(parse_pm2_jlist(&out.stdout, &ctx.user));
        }
    }

    Pm2Info {
        installed: true,
        processes,
    }
}

fn probe_proxy(ctx: &ExecContext, subsystem: &str, binary: &str, unit: &str) -> ProxyInfo {
    if !ctx.has_binary(binary) || !ctx.unit_active(unit) {
        return ProxyInfo::default();
    }
    let enabled = ctx.layout.proxy_dir(subsystem).join("sites-enabled");
    let mut sites: Vec<String> = std::fs::read_dir(&enabled)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    sites.sort();
    ProxyInfo {
        running: true,
        sites,
    }
}

fn probe_mysql(ctx: &ExecContext) -> DbServer {
    if !ctx.has_binary("mysql") || !(ctx.unit_active("mysql") || ctx.unit_active("mariadb")) {
        return DbServer::default();
    }
    let names = lines_of(ctx, CommandSpec::new("mysql").args(["-N", "-B", "-e", "SHOW DATABASES"]));
    DbServer {
        running: true,
        databases: without(names, MYSQL_SYSTEM_DATABASES),
    }
}

fn probe_postgres(ctx: &ExecContext) -> DbServer {
    if !ctx.has_binary("psql") || !ctx.unit_active("postgresql") {
        return DbServer::default();
    }
    let names = lines_of(
        ctx,
        CommandSpec::new("psql")
            .args(["-At", "-c", "SELECT datname FROM pg_database WHERE datistemplate = false"])
            .as_user("postgres"),
    );
    DbServer {
        running: true,
        databases: without(names, POSTGRES_SYSTEM_DATABASES),
    }
}

fn probe_mongodb(ctx: &ExecContext) -> DbServer {
    if !ctx.has_binary("mongod") || !ctx.unit_active("mongod") {
        return DbServer::default();
    }
    let names = lines_of(
        ctx,
        CommandSpec::new("mongosh").args([
            "--quiet",
            "--eval",
            "db.adminCommand({listDatabases: 1}).databases.forEach(d => print(d.name))",
        ]),
    );
    DbServer {
        running: true,
        databases: without(names, MONGO_SYSTEM_DATABASES),
    }
}

fn probe_redis(ctx: &ExecContext) -> DbServer {
    if !ctx.has_binary("redis-server")
        || !(ctx.unit_active("redis-server") || ctx.unit_active("redis"))
    {
        return DbServer::default();
    }
    let databases = ctx
        .probe(CommandSpec::new("redis-cli").args(["INFO", "keyspace"]))
        .map(|out| parse_redis_keyspace(&out.stdout))
        .unwrap_or_default();
    DbServer {
        running: true,
        databases,
    }
}

fn probe_services(ctx: &ExecContext) -> Vec<String> {
    ctx.probe(CommandSpec::new("systemctl").args([
        "list-units",
        "--type=service",
        "--state=running",
        "--no-legend",
        "--plain",
    ]))
    .map(|out| {
        parse_running_units(&out.stdout)
            .into_iter()
            .filter(|u| !is_system_unit(u, &[]))
            .collect()
    })
    .unwrap_or_default()
}

fn probe_ports(ctx: &ExecContext) -> Vec<u16> {
    ctx.probe(CommandSpec::new("ss").arg("-tlnH"))
        .map(|out| parse_listening_ports(&out.stdout))
        .unwrap_or_default()
}

fn probe_users(ctx: &ExecContext) -> Vec<String> {
    std::fs::read_to_string(ctx.layout.passwd())
        .map(|content| parse_passwd(&content))
        .unwrap_or_default()
}

fn probe_env_files(ctx: &ExecContext) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in ENV_ROOTS {
        for path in find_files(&ctx.layout.resolve(root), 5, is_env_file_name) {
            found.push(ctx.layout.logical(&path));
        }
    }
    found
}

fn probe_crontabs(ctx: &ExecContext, users: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut crontabs = BTreeMap::new();
    for user in std::iter::once("root").chain(users.iter().map(String::as_str)) {
        if let Some(out) = ctx.probe(CommandSpec::new("crontab").args(["-l", "-u", user])) {
            let lines = parse_crontab(&out.stdout);
            if !lines.is_empty() {
                crontabs.insert(user.to_string(), lines);
            }
        }
    }
    crontabs
}

fn probe_system(ctx: &ExecContext) -> SystemInfo {
    let (os, version) = std::fs::read_to_string(ctx.layout.os_release())
        .map(|content| parse_os_release(&content))
        .unwrap_or_default();
    SystemInfo {
        os,
        version,
        hostname: ctx.hostname.clone(),
        scan_date: chrono::Utc::now().to_rfc3339(),
    }
}

fn lines_of(ctx: &ExecContext, spec: CommandSpec) -> Vec<String> {
    ctx.probe(spec)
        .map(|out| out.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn without(names: Vec<String>, excluded: &[&str]) -> Vec<String> {
    names
        .into_iter()
        .filter(|n| !excluded.contains(&n.as_str()))
        .collect()
}

pub fn is_env_file_name(name: &str) -> bool {
    name == ".env" || name.starts_with(".env.")
}

/// First column of `systemctl list-units --plain --no-legend`, without `.service`.
pub fn parse_running_units(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|unit| unit.ends_with(".service"))
        .map(|unit| unit.trim_end_matches(".service").to_string())
        .collect()
}

/// Local ports from `ss -tlnH`, unique and sorted.
pub fn parse_listening_ports(stdout: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit(':').next())
        .filter_map(|port| port.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Regular login accounts (1000 <= uid < 65534 with a real shell).
pub fn parse_passwd(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let uid: u32 = fields[2].parse().ok()?;
            let shell = fields[6];
            let login_shell = !(shell.ends_with("nologin") || shell.ends_with("false"));
            ((1000..65534).contains(&uid) && login_shell).then(|| fields[0].to_string())
        })
        .collect()
}

/// `ID` and `VERSION_ID` from os-release.
pub fn parse_os_release(content: &str) -> (String, String) {
    let mut os = String::new();
    let mut version = String::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => os = value,
                "VERSION_ID" => version = value,
                _ => {}
            }
        }
    }
    (os, version)
}

/// `db0:keys=12,expires=0` → `db0`
pub fn parse_redis_keyspace(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .filter(|(db, rest)| db.starts_with("db") && rest.starts_with("keys="))
        .map(|(db, _)| db.to_string())
        .collect()
}

pub fn parse_crontab(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parse `pm2 jlist`, keeping name, cwd, script, owner and `PORT`.
pub fn parse_pm2_jlist(stdout: &str, owner: &str) -> Vec<Pm2Process> {
    // pm2 sometimes prints warnings before the JSON array
    let json = match stdout.find("[{").or_else(|| stdout.find("[]")) {
        Some(start) => &stdout[start..],
        None => return Vec::new(),
    };
    let values: Vec<serde_json::Value> = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparseable pm2 jlist: {}", e);
            return Vec::new();
        }
    };

    values
        .iter()
        .filter_map(|v| {
            let env = v.get("pm2_env")?;
            let cwd = env.get("pm_cwd")?.as_str()?;
            let mut vars = BTreeMap::new();
            if let Some(port) = env.get("env").and_then(|e| e.get("PORT")) {
                let port = match port {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                vars.insert("PORT".to_string(), port);
            }
            Some(Pm2Process {
                name: v.get("name")?.as_str()?.to_string(),
                pm2_env: Pm2Env {
                    pm_cwd: PathBuf::from(cwd),
                    pm_exec_path: env
                        .get("pm_exec_path")
                        .and_then(|p| p.as_str())
                        .map(PathBuf::from)
                        .unwrap_or_default(),
                    username: env
                        .get("username")
                        .and_then(|u| u.as_str())
                        .map(str::to_string)
                        .or_else(|| Some(owner.to_string())),
                    env: vars,
                },
            })
        })
        .collect()
}
