use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Format check, clippy and tests, as run in CI
    Ci {
        /// Skip the test run
        #[arg(long)]
        no_test: bool,
    },
    /// Run the test suite with logs enabled
    Test {
        #[arg(long, default_value = "debug")]
        log_level: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Ci { no_test } => ci(no_test)?,
        Cmd::Test { log_level } => test(&log_level)?,
    }

    Ok(())
}

fn cargo(step: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .status()
        .with_context(|| format!("Failed to run cargo {step}"))?;

    if !status.success() {
        anyhow::bail!("cargo {step} failed");
    }
    println!("✓ {step}");
    Ok(())
}

fn ci(no_test: bool) -> Result<()> {
    cargo("fmt", &["fmt", "--all", "--", "--check"])?;
    cargo("clippy", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    if !no_test {
        cargo("test", &["test", "--workspace"])?;
    }
    Ok(())
}

fn test(log_level: &str) -> Result<()> {
    // Integration tests initialize env_logger from RUST_LOG
    std::env::set_var("RUST_LOG", log_level);
    cargo("test", &["test", "--workspace", "--", "--nocapture"])
}
