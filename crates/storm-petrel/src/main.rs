mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "storm-petrel")]
#[command(about = "Multi-tenant SFTP/SCP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/storm-petrel/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the SFTP server
    Serve,

    /// Write a default configuration file
    InitConfig,

    /// Generate a private host key
    GenKey {
        /// Destination file; defaults to the key's standard name next to
        /// the config file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Key algorithm: rsa, ecdsa or ed25519
        #[arg(short, long, default_value = "ed25519")]
        algorithm: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storm_petrel=info,storm_petrel_sftp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => commands::serve::run(&cli.config).await?,
        Commands::InitConfig => commands::serve::init_config(&cli.config).await?,
        Commands::GenKey { output, algorithm } => {
            commands::keygen::run(&cli.config, output, algorithm).await?
        }
    }

    Ok(())
}
