//! Server configuration
//!
//! The configuration document is immutable after initialization; the server
//! snapshots it into a shared context instead of mutating globals. Paths may
//! be relative to the configuration directory supplied at startup.

use crate::actions::ActionsConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Umask applied when nothing valid is configured.
pub const DEFAULT_UMASK: u32 = 0o022;

/// Default private host key files created in the configuration directory
/// when no keys are configured.
pub const DEFAULT_RSA_HOST_KEY_NAME: &str = "id_rsa";
pub const DEFAULT_ECDSA_HOST_KEY_NAME: &str = "id_ecdsa";

/// How uploaded files reach their final path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Write directly to the requested path.
    #[default]
    Direct,
    /// Write to a sibling temporary file and rename on success; the
    /// temporary is deleted on error so the target never holds a partial
    /// file.
    Atomic,
    /// Like `atomic`, but on error the temporary is renamed to the target
    /// path so a later session can resume the upload.
    AtomicWithResume,
}

/// Whether SETSTAT requests for permissions and ownership are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetstatMode {
    #[default]
    Apply,
    /// Silently acknowledge without changing anything. Useful for clients
    /// that insist on chmod after every upload.
    Ignore,
}

/// PROXY protocol acceptance policy for the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyPolicy {
    #[default]
    Off,
    /// Header used when present; connections without one are accepted.
    Optional,
    /// Header required; connections without one are rejected.
    Required,
}

/// A host key descriptor. The path is resolved against the configuration
/// directory unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKey {
    pub private_key: PathBuf,
}

/// SFTP front-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identification string; the wire identifier is `SSH-2.0-<banner>`.
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Listen address; blank means all interfaces.
    #[serde(default)]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Idle timeout in minutes; 0 disables the idle sweeper.
    #[serde(default)]
    pub idle_timeout: u64,

    /// Maximum authentication attempts per connection. Negative means
    /// unlimited, zero means the implementation default of six.
    #[serde(default)]
    pub max_auth_tries: i32,

    /// Octal umask for new files, e.g. `"022"`.
    #[serde(default = "default_umask_string")]
    pub umask: String,

    #[serde(default)]
    pub upload_mode: UploadMode,

    #[serde(default)]
    pub setstat_mode: SetstatMode,

    /// Host keys; when empty the default RSA and ECDSA keys are generated
    /// in the configuration directory.
    #[serde(default)]
    pub host_keys: Vec<HostKey>,

    /// Allowed key-exchange algorithms in preference order; empty keeps the
    /// built-in defaults. Unknown names are warned about and ignored.
    #[serde(default)]
    pub kex_algorithms: Vec<String>,

    #[serde(default)]
    pub ciphers: Vec<String>,

    #[serde(default)]
    pub macs: Vec<String>,

    /// File whose contents are sent to clients before authentication.
    #[serde(default)]
    pub login_banner_file: Option<PathBuf>,

    /// Enabled SSH exec commands; `*` expands to every supported command.
    #[serde(default = "default_ssh_commands")]
    pub enabled_ssh_commands: Vec<String>,

    /// Absolute path of an external helper used for keyboard-interactive
    /// authentication. Unset, relative or missing paths disable the method.
    #[serde(default)]
    pub keyboard_interactive_program: Option<PathBuf>,

    #[serde(default)]
    pub proxy_protocol: ProxyPolicy,

    /// Networks allowed to send a PROXY header.
    #[serde(default)]
    pub proxy_allowed: Vec<String>,

    /// Multipart part size for object-store uploads, in mebibytes.
    #[serde(default = "default_part_size_mb")]
    pub object_part_size_mb: usize,

    #[serde(default)]
    pub actions: ActionsConfig,
}

impl Default for Config {
    fn default() -> Self {
        // serde defaults and Default must agree; round-tripping an empty
        // document is the simplest way to keep them in lockstep.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Parse the configured umask, falling back with a warning on a malformed
    /// value. A bad umask downgrades, it never aborts startup.
    pub fn parsed_umask(&self) -> u32 {
        match u32::from_str_radix(&self.umask, 8) {
            Ok(value) if value <= 0o777 => value,
            Ok(value) => {
                warn!("umask {:o} out of range, using {:o}", value, DEFAULT_UMASK);
                DEFAULT_UMASK
            }
            Err(err) => {
                warn!(
                    "error reading umask {:?}, please fix your config file: {}",
                    self.umask, err
                );
                DEFAULT_UMASK
            }
        }
    }

    /// Multipart part size in bytes, clamped to the S3 minimum of 5 MiB.
    pub fn object_part_size(&self) -> usize {
        self.object_part_size_mb.max(5) * 1024 * 1024
    }

    /// Address string for the TCP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    /// Effective auth attempt budget: negative = unlimited, zero = six.
    pub fn effective_max_auth_tries(&self) -> Option<u32> {
        match self.max_auth_tries {
            n if n < 0 => None,
            0 => Some(6),
            n => Some(n as u32),
        }
    }

    /// Startup validation for the errors that must be fatal: anything that
    /// would prevent the listener from working at all.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.bind_port == 0 {
            return Err(crate::error::Error::Config(
                "bind_port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_banner() -> String {
    "StormPetrel".to_string()
}

fn default_bind_port() -> u16 {
    2022
}

fn default_umask_string() -> String {
    "022".to_string()
}

fn default_ssh_commands() -> Vec<String> {
    crate::ssh_commands::DEFAULT_COMMANDS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_part_size_mb() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.banner, "StormPetrel");
        assert_eq!(config.bind_port, 2022);
        assert_eq!(config.upload_mode, UploadMode::Direct);
        assert_eq!(config.setstat_mode, SetstatMode::Apply);
        assert_eq!(config.proxy_protocol, ProxyPolicy::Off);
        assert_eq!(config.parsed_umask(), 0o022);
        assert_eq!(
            config.enabled_ssh_commands,
            vec!["md5sum", "sha1sum", "cd", "pwd"]
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let doc = r#"
            banner = "Example"
            bind_address = "127.0.0.1"
            bind_port = 2222
            idle_timeout = 15
            max_auth_tries = 3
            umask = "077"
            upload_mode = "atomic_with_resume"
            setstat_mode = "ignore"
            proxy_protocol = "required"
            proxy_allowed = ["10.0.0.0/8"]
            enabled_ssh_commands = ["*"]

            [[host_keys]]
            private_key = "keys/id_ed25519"
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert_eq!(config.banner, "Example");
        assert_eq!(config.bind_addr(), "127.0.0.1:2222");
        assert_eq!(config.upload_mode, UploadMode::AtomicWithResume);
        assert_eq!(config.setstat_mode, SetstatMode::Ignore);
        assert_eq!(config.proxy_protocol, ProxyPolicy::Required);
        assert_eq!(config.parsed_umask(), 0o077);
        assert_eq!(config.host_keys.len(), 1);
    }

    #[test]
    fn test_bad_umask_downgrades() {
        let mut config = Config::default();
        config.umask = "9z".to_string();
        assert_eq!(config.parsed_umask(), DEFAULT_UMASK);

        config.umask = "7777".to_string();
        assert_eq!(config.parsed_umask(), DEFAULT_UMASK);
    }

    #[test]
    fn test_max_auth_tries_policy() {
        let mut config = Config::default();
        assert_eq!(config.effective_max_auth_tries(), Some(6));

        config.max_auth_tries = -1;
        assert_eq!(config.effective_max_auth_tries(), None);

        config.max_auth_tries = 2;
        assert_eq!(config.effective_max_auth_tries(), Some(2));
    }

    #[test]
    fn test_part_size_floor() {
        let mut config = Config::default();
        config.object_part_size_mb = 1;
        assert_eq!(config.object_part_size(), 5 * 1024 * 1024);

        config.object_part_size_mb = 8;
        assert_eq!(config.object_part_size(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_zero_port_is_fatal() {
        let mut config = Config::default();
        config.bind_port = 0;
        assert!(config.validate().is_err());
    }
}
