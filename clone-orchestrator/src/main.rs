mod config;
mod error;
mod pipeline;
mod ssh;

use crate::config::{OrchestratorConfig, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(1);
        }
    };

    if !config.agent_binary.exists() {
        anyhow::bail!(
            "Agent binary not found at {}. Build with: cargo build --release -p clone-agent",
            config.agent_binary.display()
        );
    }

    let run_id = uuid::Uuid::new_v4();

    // ssh2 sessions are blocking
    let summary = tokio::task::spawn_blocking(move || pipeline::run(&config, run_id)).await??;

    tracing::info!(
        run_id = %summary.run_id,
        elapsed_secs = (summary.finished_at - summary.started_at).num_seconds(),
        "Clone run finished"
    );
    println!(
        "{} done, {} skipped, {} failed",
        summary.done,
        summary.skipped,
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!("  FAILED {}", failure);
    }
    for line in &summary.verification {
        println!("{}", line);
    }
    println!("Local bundle kept at {}", summary.local_bundle.display());
    Ok(())
}
