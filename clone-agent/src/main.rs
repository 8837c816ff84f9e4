//! Server Clone Agent - Main entry point
//!
//! `scan`, `backup` and `restore` run independently on a host; the
//! orchestrator chains them across two hosts.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use clone_agent::{backup, inventory, restore, utils, Config, ExecContext, Inventory, SystemLayout, SystemRunner};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "server-clone", author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an inventory of this host as JSON
    Scan {
        /// Inventory output path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Back up everything an inventory lists into one bundle
    Backup {
        /// Inventory produced by `scan`
        #[arg(short, long, value_name = "FILE")]
        inventory: PathBuf,

        /// Application user on this host
        #[arg(short, long)]
        user: String,

        /// Bundle path or directory (defaults to [bundle] output_dir)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Restore a bundle onto this host
    Restore {
        /// Bundle produced by `backup`
        #[arg(short, long, value_name = "FILE")]
        backup: PathBuf,

        /// Fallback owner for restored files
        #[arg(short, long)]
        user: String,

        /// Write the restore report as JSON
        #[arg(short, long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", Args::command().render_usage());
            std::process::exit(1);
        }
    };

    if let Some(path) = missing_input(&args.command) {
        eprintln!("error: input file not found: {}", path.display());
        eprintln!("{}", Args::command().render_usage());
        std::process::exit(1);
    }

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting server-clone v{}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; installs, ownership changes and service control will likely fail");
    }

    let runner = SystemRunner;
    let layout = SystemLayout::new(&config.layout.root);

    match args.command {
        Command::Scan { output } => {
            let ctx = ExecContext::new(&runner, layout, whoami());
            let inventory = inventory::scan(&ctx);
            inventory.save(&output)?;
            println!("Inventory written to {}", output.display());
        }
        Command::Backup {
            inventory,
            user,
            output,
        } => {
            let inventory = Inventory::load(&inventory)?;
            let ctx = ExecContext::new(&runner, layout, user);
            let outcome = backup::backup(&ctx, &config, &inventory, output.as_deref())?;
            print!("{}", outcome.report);
            println!("Backup written to {}", outcome.bundle.display());
        }
        Command::Restore {
            backup,
            user,
            report,
        } => {
            let mut ctx = ExecContext::new(&runner, layout, user);
            let run_report = restore::restore_bundle(&mut ctx, &config, &backup)?;
            if let Some(path) = report {
                run_report.write_json(&path)?;
            }
            print!("{}", run_report);
        }
    }

    Ok(())
}

/// The input file a command reads, when it does not exist.
fn missing_input(command: &Command) -> Option<&Path> {
    let input = match command {
        Command::Scan { .. } => return None,
        Command::Backup { inventory, .. } => inventory,
        Command::Restore { backup, .. } => backup,
    };
    (!input.is_file()).then_some(input.as_path())
}

/// Name of the effective user, for scans run without `--user`.
fn whoami() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Command {
        Args::try_parse_from(argv).expect("valid arguments").command
    }

    #[test]
    fn test_missing_inputs_detected() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let inventory = dir.path().join("inventory.json");
        let inventory_arg = inventory.to_string_lossy().into_owned();

        let backup = parse(&["server-clone", "backup", "--inventory", &inventory_arg, "--user", "alice"]);
        assert_eq!(missing_input(&backup), Some(inventory.as_path()));

        std::fs::write(&inventory, "{}")?;
        assert_eq!(missing_input(&backup), None);

        let restore = parse(&["server-clone", "restore", "--backup", "/nonexistent/b.tar.gz", "--user", "alice"]);
        assert_eq!(missing_input(&restore), Some(Path::new("/nonexistent/b.tar.gz")));

        let scan = parse(&["server-clone", "scan", "--output", "/tmp/inventory.json"]);
        assert_eq!(missing_input(&scan), None);
        Ok(())
    }
}
