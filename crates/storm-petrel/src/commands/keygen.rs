use crate::config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use storm_petrel_sftp::keys::KeyAlgorithm;

pub async fn run(config_path: &Path, output: Option<PathBuf>, algorithm: String) -> Result<()> {
    let (algorithm, default_name) = match algorithm.as_str() {
        "rsa" => (
            KeyAlgorithm::Rsa,
            storm_petrel_sftp::config::DEFAULT_RSA_HOST_KEY_NAME,
        ),
        "ecdsa" => (
            KeyAlgorithm::Ecdsa,
            storm_petrel_sftp::config::DEFAULT_ECDSA_HOST_KEY_NAME,
        ),
        "ed25519" => (KeyAlgorithm::Ed25519, "id_ed25519"),
        other => anyhow::bail!("unsupported key algorithm {:?}", other),
    };

    let destination =
        output.unwrap_or_else(|| config::config_dir(config_path).join(default_name));

    if destination.exists() {
        anyhow::bail!("refusing to overwrite existing key {:?}", destination);
    }

    storm_petrel_sftp::keys::generate_key(&destination, algorithm)
        .await
        .context("key generation failed")?;
    println!("Private host key written to: {}", destination.display());
    Ok(())
}
