use crate::config;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use storm_petrel_sftp::SftpServer;
use tracing::info;

pub async fn init_config(config_path: &Path) -> Result<()> {
    let default_config = config::AppConfig::default();
    config::save_config(config_path, &default_config).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nAdd at least one [[users]] entry before starting the server.");
    Ok(())
}

pub async fn run(config_path: &Path) -> Result<()> {
    info!("starting storm-petrel server...");

    let app_config = config::load_config(config_path)
        .await
        .context("failed to load configuration")?;
    info!("configuration loaded from {}", config_path.display());

    let provider = Arc::new(config::build_provider(&app_config)?);
    let config_dir = config::config_dir(config_path);

    let server = SftpServer::new(app_config.sftpd, &config_dir, provider, None)
        .await
        .context("failed to initialize server")?;

    tokio::select! {
        result = server.run() => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
