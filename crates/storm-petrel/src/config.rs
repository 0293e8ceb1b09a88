//! Application configuration file
//!
//! The TOML document wraps the SFTP front-end configuration with the account
//! table served by the built-in static identity provider. Deployments with
//! an external identity store embed the library and supply their own
//! provider instead.

use anyhow::{Context, Result};
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use storm_petrel_core::{LoginMethod, Permission, StaticAccount, StaticProvider, StorageKind, User};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sftpd: storm_petrel_sftp::Config,

    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// One account in the static user table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub home_dir: PathBuf,

    /// Plain password; omit to allow key-only logins.
    #[serde(default)]
    pub password: Option<String>,

    /// Public keys in OpenSSH `authorized_keys` line format.
    #[serde(default)]
    pub authorized_keys: Vec<String>,

    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub max_sessions: usize,
    #[serde(default)]
    pub allowed_login_methods: Vec<LoginMethod>,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub storage: StorageKind,

    /// Virtual path -> permissions; defaults to full access under `/`.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,
}

impl UserEntry {
    fn to_account(&self, id: u64) -> Result<StaticAccount> {
        let mut permissions = self.permissions.clone();
        if permissions.is_empty() {
            permissions.insert("/".to_string(), vec![Permission::Any]);
        }

        let user = User {
            id,
            username: self.username.clone(),
            home_dir: self.home_dir.clone(),
            uid: self.uid,
            gid: self.gid,
            permissions,
            max_sessions: self.max_sessions,
            allowed_login_methods: self.allowed_login_methods.clone(),
            allowed_sources: self.allowed_sources.clone(),
            key_prefix: self.key_prefix.clone(),
            storage: self.storage,
        };

        let mut authorized_keys = Vec::new();
        for line in &self.authorized_keys {
            let encoded = line
                .split_whitespace()
                .nth(1)
                .with_context(|| format!("malformed authorized key for {:?}", self.username))?;
            let key = russh_keys::parse_public_key_base64(encoded).with_context(|| {
                format!("unparseable authorized key for {:?}", self.username)
            })?;
            authorized_keys.push((key.public_key_bytes(), key.fingerprint()));
        }

        Ok(StaticAccount {
            user,
            password: self.password.clone(),
            authorized_keys,
        })
    }
}

pub async fn load_config(path: &Path) -> Result<AppConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read configuration file {:?}", path))?;
    toml::from_str(&contents).with_context(|| format!("unable to parse {:?}", path))
}

pub async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let rendered = toml::to_string_pretty(config)?;
    tokio::fs::write(path, rendered).await?;
    Ok(())
}

/// Build the static identity provider from the configured account table.
pub fn build_provider(config: &AppConfig) -> Result<StaticProvider> {
    let mut provider = StaticProvider::new();
    for (index, entry) in config.users.iter().enumerate() {
        provider.add_account(entry.to_account(index as u64 + 1)?);
    }
    Ok(provider)
}

/// Directory that relative paths in the configuration resolve against.
pub fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
