//! dockyard CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(about = "dockyard deployment CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "DOCKYARD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy every service of a project with pending changes
    Deploy {
        /// Project ID
        project: String,
    },
    /// Show pending changes of a project
    Diff {
        /// Project ID
        project: String,
    },
    /// Stream logs
    Logs {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "dockyard.kdl")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Build output of a deployment, live while it runs
    Build {
        /// Deployment ID
        deployment: String,
    },
    /// Runtime output of every task of a service
    Service {
        /// Service ID
        service: String,
        /// Lines to show from the end of each task's output
        #[arg(long)]
        tail: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = commands::ApiClient::new(&cli.api_url);

    match cli.command {
        Commands::Deploy { project } => {
            commands::deploy::deploy(&client, &project).await?;
        }
        Commands::Diff { project } => {
            commands::deploy::diff(&client, &project).await?;
        }
        Commands::Logs { command } => match command {
            LogCommands::Build { deployment } => {
                commands::logs::build(&client, &deployment).await?;
            }
            LogCommands::Service { service, tail } => {
                commands::logs::service(&client, &service, tail).await?;
            }
        },
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
