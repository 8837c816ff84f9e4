//! Database dump restores.
//!
//! Every restore is safe to repeat: creation steps tolerate an existing
//! database and imports run against whatever is already there.

use std::path::Path;

use crate::exec::{CommandSpec, ExecContext};
use crate::utils::errors::{CloneError, Result};

/// Whether the database had to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOutcome {
    Created,
    Existing,
}

/// `CREATE DATABASE IF NOT EXISTS` then import.
pub fn restore_mysql(ctx: &ExecContext, name: &str, dump: &Path) -> Result<()> {
    ctx.run(CommandSpec::new("mysql").args([
        "-e",
        &format!("CREATE DATABASE IF NOT EXISTS `{}`", name.replace('`', "")),
    ]))?;
    ctx.run(CommandSpec::new("mysql").arg(name).stdin_from(dump))?;
    Ok(())
}

/// Create the database as `postgres`, tolerating one that already exists.
pub fn create_postgres(ctx: &ExecContext, name: &str) -> Result<DbOutcome> {
    match ctx.run(CommandSpec::new("createdb").as_user("postgres").arg(name)) {
        Ok(_) => Ok(DbOutcome::Created),
        Err(CloneError::Command { stderr, .. }) if stderr.contains("already exists") => {
            Ok(DbOutcome::Existing)
        }
        Err(e) => Err(e),
    }
}

pub fn import_postgres(ctx: &ExecContext, name: &str, dump: &Path) -> Result<()> {
    ctx.run(
        CommandSpec::new("psql")
            .as_user("postgres")
            .args(["-q", "-d", name])
            .stdin_from(dump),
    )?;
    Ok(())
}

pub fn restore_mongo(ctx: &ExecContext, archive: &Path) -> Result<()> {
    ctx.run(
        CommandSpec::new("mongorestore")
            .arg(format!("--archive={}", archive.display()))
            .arg("--drop"),
    )?;
    Ok(())
}

/// Swap in the RDB snapshot while the server is stopped.
pub fn restore_redis(ctx: &ExecContext, dump: &Path) -> Result<()> {
    let target = ctx.layout.redis_dump();
    ctx.run(CommandSpec::new("systemctl").args(["stop", "redis-server"]))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(dump, &target)?;
    ctx.run(CommandSpec::new("chown").arg("redis:redis").path_arg(&target))?;
    ctx.run(CommandSpec::new("systemctl").args(["start", "redis-server"]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::SystemLayout;

    #[test]
    fn test_mysql_creates_then_imports() -> Result<()> {
        let runner = FakeRunner::new();
        let ctx = ExecContext::new(&runner, SystemLayout::default(), "root");

        restore_mysql(&ctx, "shop", Path::new("/tmp/x/databases/mysql-shop.sql"))?;
        assert_eq!(
            runner.calls(),
            vec![
                "mysql -e CREATE DATABASE IF NOT EXISTS `shop`".to_string(),
                "mysql shop < /tmp/x/databases/mysql-shop.sql".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_createdb_tolerates_existing() -> Result<()> {
        let runner = FakeRunner::new();
        let ctx = ExecContext::new(&runner, SystemLayout::default(), "root");

        assert_eq!(create_postgres(&ctx, "shop")?, DbOutcome::Created);
        assert_eq!(create_postgres(&ctx, "shop")?, DbOutcome::Existing);
        assert!(runner.ran("sudo -u postgres -H -- createdb shop"));
        Ok(())
    }

    #[test]
    fn test_createdb_other_errors_propagate() {
        let runner = FakeRunner::new().fail("createdb", "could not connect to server");
        let ctx = ExecContext::new(&runner, SystemLayout::default(), "root");
        assert!(create_postgres(&ctx, "shop").is_err());
    }

    #[test]
    fn test_redis_dump_swapped_in() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let dump = dir.path().join("redis-dump.rdb");
        std::fs::write(&dump, b"REDIS0009")?;

        let runner = FakeRunner::new();
        let ctx = ExecContext::new(&runner, SystemLayout::new(dir.path().join("root")), "root");
        restore_redis(&ctx, &dump)?;

        assert_eq!(std::fs::read(ctx.layout.redis_dump())?, b"REDIS0009");
        let calls = runner.calls();
        assert!(calls[0].contains("stop redis-server"));
        assert!(calls[2].contains("start redis-server"));
        Ok(())
    }
}
