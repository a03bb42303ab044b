use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::ApiClient;
use commands::{Exit, OutputFormat};

#[derive(Parser)]
#[command(
    name = "cutover",
    about = "Cutover — blue/green deployments for long-running services",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Daemon address.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8480")]
    server: String,

    /// Output format: text or json
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a version of a service
    Deploy {
        service: String,
        /// Image tag to deploy
        tag: String,
        /// Environment for the new instances, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = commands::deploy::parse_env)]
        env: Vec<(String, String)>,
        /// Opaque configuration artifact reference
        #[arg(long)]
        config_artifact: Option<String>,
        /// Poll until the deployment finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Show one deployment
    Status { deployment: String },
    /// Cancel a running deployment and roll it back
    Cancel { deployment: String },
    /// List finished deployments of a service
    History { service: String },
    /// List registered services
    Services,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server);
    let format = cli.format;

    let result = match cli.command {
        Commands::Deploy {
            service,
            tag,
            env,
            config_artifact,
            wait,
        } => {
            let request = commands::deploy::request(&tag, env, config_artifact);
            commands::deploy::deploy(&client, &service, &request, wait, format).await
        }
        Commands::Status { deployment } => {
            commands::deployments::status(&client, &deployment, format).await
        }
        Commands::Cancel { deployment } => {
            commands::deployments::cancel(&client, &deployment, format).await
        }
        Commands::History { service } => {
            commands::deployments::history(&client, &service, format).await
        }
        Commands::Services => commands::services::list(&client, format).await,
    };

    match result {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("error: {e:#}");
            Exit::Internal.into()
        }
    }
}
