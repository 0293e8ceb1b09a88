//! Host key material
//!
//! Loads the configured private host keys. When no keys are configured the
//! two default filenames in the configuration directory are used (one RSA,
//! one ECDSA); missing defaults are generated in place, existing files are
//! reused. Key files that exist but cannot be read or parsed are fatal to
//! startup: serving with a different identity than configured would train
//! clients onto the wrong fingerprint.

use crate::config::{Config, DEFAULT_ECDSA_HOST_KEY_NAME, DEFAULT_RSA_HOST_KEY_NAME};
use crate::error::{Error, Result};
use russh_keys::key::{KeyPair, SignatureHash};
use std::path::{Path, PathBuf};
use tracing::info;

/// Generated RSA modulus size; ssh-keygen's current default.
const RSA_BITS: usize = 3072;

/// Key types the generator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyAlgorithm {
    fn generate(self) -> Result<KeyPair> {
        let key = match self {
            KeyAlgorithm::Rsa => KeyPair::generate_rsa(RSA_BITS, SignatureHash::SHA2_256),
            KeyAlgorithm::Ecdsa => KeyPair::generate_ecdsa(),
            KeyAlgorithm::Ed25519 => KeyPair::generate_ed25519(),
        };
        key.ok_or_else(|| Error::Config(format!("failed to generate {:?} host key", self)))
    }
}

/// Resolve a key path against the configuration directory unless absolute.
fn resolve(config_dir: &Path, key_path: &Path) -> PathBuf {
    if key_path.is_absolute() {
        key_path.to_path_buf()
    } else {
        config_dir.join(key_path)
    }
}

/// Load every configured host key. With an empty configured list the two
/// default key files are used, generated when missing. The returned list is
/// never empty.
pub async fn load_host_keys(config: &Config, config_dir: &Path) -> Result<Vec<KeyPair>> {
    if config.host_keys.is_empty() {
        let defaults = [
            (DEFAULT_RSA_HOST_KEY_NAME, KeyAlgorithm::Rsa),
            (DEFAULT_ECDSA_HOST_KEY_NAME, KeyAlgorithm::Ecdsa),
        ];

        let mut keys = Vec::with_capacity(defaults.len());
        for (name, algorithm) in defaults {
            let path = config_dir.join(name);
            if !path.exists() {
                info!(
                    "no host keys configured and {:?} does not exist; generating a new key",
                    path
                );
                generate_key(&path, algorithm).await?;
            }
            info!("loading private host key {:?}", path);
            keys.push(load_key(&path).await?);
        }
        return Ok(keys);
    }

    let mut keys = Vec::with_capacity(config.host_keys.len());
    for descriptor in &config.host_keys {
        let path = resolve(config_dir, &descriptor.private_key);
        if !path.exists() {
            return Err(Error::Config(format!(
                "host key file {:?} does not exist",
                path
            )));
        }
        info!("loading private host key {:?}", path);
        keys.push(load_key(&path).await?);
    }
    Ok(keys)
}

async fn load_key(path: &Path) -> Result<KeyPair> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("unable to read host key {:?}: {}", path, e)))?;
    russh_keys::decode_secret_key(&pem, None)
        .map_err(|e| Error::Config(format!("unable to parse host key {:?}: {}", path, e)))
}

/// Generate and persist a new private key at `path`.
pub async fn generate_key(path: &Path, algorithm: KeyAlgorithm) -> Result<KeyPair> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let key = algorithm.generate()?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| Error::Config(format!("unable to encode host key: {}", e)))?;
    tokio::fs::write(path, &pem).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(key)
}
