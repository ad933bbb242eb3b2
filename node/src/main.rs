//! Elastic rendezvous node binary

use clap::{Parser, Subcommand, ValueEnum};
use rendezvous_node::{inspect_sled, run_simulation, BackendKind, SimulationConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "rendezvous-node")]
#[command(about = "Elastic rendezvous tools")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Sled,
}

#[derive(Subcommand)]
enum Commands {
    /// Run participants in this process until their round completes
    Simulate {
        /// Backend holding the shared state
        #[arg(long, value_enum, default_value = "memory")]
        backend: Backend,

        /// Data directory of the sled backend
        #[arg(long, default_value = "./data/rendezvous")]
        data_dir: PathBuf,

        #[arg(long, default_value = "simulation")]
        run_id: String,

        /// Participants to start
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        #[arg(long, default_value = "2")]
        min_nodes: i64,

        #[arg(long, default_value = "3")]
        max_nodes: i64,

        /// Join timeout in seconds
        #[arg(long)]
        join_timeout: Option<i64>,

        /// Last call timeout in seconds
        #[arg(long, default_value = "1")]
        last_call_timeout: i64,

        /// Close timeout in seconds
        #[arg(long)]
        close_timeout: Option<i64>,

        /// Stay in the completed round instead of leaving it
        #[arg(long)]
        keep_membership: bool,
    },

    /// Print the rendezvous state stored by the sled backend
    Inspect {
        /// Data directory of the sled backend
        #[arg(long, default_value = "./data/rendezvous")]
        data_dir: PathBuf,

        /// Only show this run
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            backend,
            data_dir,
            run_id,
            nodes,
            min_nodes,
            max_nodes,
            join_timeout,
            last_call_timeout,
            close_timeout,
            keep_membership,
        } => {
            let backend = match backend {
                Backend::Memory => BackendKind::Memory,
                Backend::Sled => {
                    std::fs::create_dir_all(&data_dir)?;
                    BackendKind::Sled(data_dir)
                }
            };

            let config = SimulationConfig {
                backend,
                run_id,
                nodes,
                min_nodes,
                max_nodes,
                join_timeout_secs: join_timeout,
                last_call_timeout_secs: Some(last_call_timeout),
                close_timeout_secs: close_timeout,
                shutdown: !keep_membership,
                ..Default::default()
            };

            let report = run_simulation(&config).await?;
            info!(
                "Simulation finished: {} joined, {} failed",
                report.participants.len(),
                report.failures.len()
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Inspect { data_dir, run_id } => {
            let summaries = inspect_sled(&data_dir, run_id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }

    Ok(())
}
