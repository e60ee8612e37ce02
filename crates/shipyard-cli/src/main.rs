//! Shipyard CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::RuntimeArgs;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Run pipelines on Docker or Kubernetes", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Path to the pipeline file
        #[arg(default_value = "shipyard.kdl")]
        path: PathBuf,
        /// Build identifier (defaults to a fresh UUIDv7)
        #[arg(long)]
        build_id: Option<String>,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = "shipyard.kdl")]
        path: PathBuf,
        /// Print the compiled build as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { path, build_id } => {
            let setup = cli.runtime.resolve()?;
            commands::run::run(setup, &path, build_id).await?;
        }
        Commands::Validate { path, json } => {
            commands::validate::validate(&path, json)?;
        }
    }

    Ok(())
}
