//! cutoverd — the Cutover daemon.
//!
//! Single binary that assembles all Cutover subsystems:
//! - History store (redb)
//! - Registry, compute, and load balancer backends
//! - Target group model + health prober
//! - Traffic router
//! - Orchestrator
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cutoverd init --service orders --image registry.local/orders > cutover.toml
//! cutoverd run --config cutover.toml --port 8480 --data-dir /var/lib/cutover
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod daemon;

#[derive(Parser)]
#[command(name = "cutoverd", about = "Cutover daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and its REST API.
    Run {
        /// Path to cutover.toml.
        #[arg(short, long, default_value = "cutover.toml")]
        config: PathBuf,

        /// Port to listen on. Overrides [daemon].port.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the history store. Overrides [daemon].data_dir.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// How often to retry tearing down stale groups, in seconds.
        #[arg(long, default_value = "60")]
        stale_retry_interval: u64,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Print a starter cutover.toml for one service.
    Init {
        #[arg(long)]
        service: String,

        #[arg(long)]
        image: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cutoverd=debug,cutover=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            stale_retry_interval,
            log_format,
        } => {
            init_tracing(log_format);
            let options = daemon::Options {
                config,
                port,
                data_dir,
                stale_retry_interval: std::time::Duration::from_secs(stale_retry_interval.max(1)),
            };
            daemon::run(options).await
        }
        Command::Init { service, image } => {
            let config = cutover_core::CutoverConfig::scaffold(&service, &image);
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
