//! User records and per-path permissions
//!
//! A `User` is produced by the identity provider on a successful credential
//! check and carried on the connection for its whole lifetime. The permission
//! map is keyed by virtual paths inside the user's sandboxed view; lookups
//! walk up the path until a granting entry is found, so a rule on `/` acts as
//! the default for the whole tree.

use crate::net::CidrBlock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

/// SSH authentication methods supported by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    Password,
    PublicKey,
    KeyboardInteractive,
}

impl LoginMethod {
    /// Stable wire/metric label for the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Password => "password",
            LoginMethod::PublicKey => "publickey",
            LoginMethod::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-path capabilities a user may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Grants every other permission.
    #[serde(rename = "*")]
    Any,
    /// Enumerate directory contents and stat entries.
    List,
    /// Read file contents.
    Download,
    /// Create new files.
    Upload,
    /// Replace existing files.
    Overwrite,
    /// Remove files and directories.
    Delete,
    /// Rename files and directories.
    Rename,
    /// Create directories.
    CreateDirs,
    /// Create symbolic links.
    CreateSymlinks,
}

/// Which filesystem backend serves the user's home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Local,
    Object,
}

/// A provisioned account as handed back by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable numeric id.
    pub id: u64,
    pub username: String,
    /// Must be absolute; enforced by the login gate.
    pub home_dir: PathBuf,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    /// Virtual path -> granted permissions. Empty map means no access.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,
    /// Maximum concurrent registered connections; 0 means unlimited.
    #[serde(default)]
    pub max_sessions: usize,
    /// Allowed authentication methods; empty means all methods.
    #[serde(default)]
    pub allowed_login_methods: Vec<LoginMethod>,
    /// Allowed source networks in CIDR notation; empty means any address.
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    /// Key prefix prepended to every path, giving the user a chroot-like view
    /// inside a shared bucket or tree.
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub storage: StorageKind,
}

impl Default for User {
    /// The zero-valued user: no home, no permissions. Used as the fallback
    /// when a channel is served without an authenticated record; it can list
    /// nothing and touch nothing.
    fn default() -> Self {
        User {
            id: 0,
            username: String::new(),
            home_dir: PathBuf::new(),
            uid: 0,
            gid: 0,
            permissions: HashMap::new(),
            max_sessions: 0,
            allowed_login_methods: Vec::new(),
            allowed_sources: Vec::new(),
            key_prefix: String::new(),
            storage: StorageKind::Local,
        }
    }
}

impl User {
    /// Convenience constructor granting full access under `/`.
    pub fn with_full_access(username: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            id: 1,
            username: username.into(),
            home_dir: home_dir.into(),
            permissions,
            ..Default::default()
        }
    }

    pub fn is_login_method_allowed(&self, method: LoginMethod) -> bool {
        self.allowed_login_methods.is_empty() || self.allowed_login_methods.contains(&method)
    }

    pub fn is_login_from_addr_allowed(&self, addr: IpAddr) -> bool {
        if self.allowed_sources.is_empty() {
            return true;
        }
        let blocks = CidrBlock::parse_list(&self.allowed_sources);
        CidrBlock::matches_any(&blocks, addr)
    }

    /// Permissions applying to `path`: the entry for the closest ancestor
    /// (including `path` itself) wins.
    pub fn permissions_for(&self, path: &str) -> &[Permission] {
        let mut current = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        loop {
            if let Some(perms) = self.permissions.get(&current) {
                return perms;
            }
            if current == "/" {
                return &[];
            }
            current = match current.rfind('/') {
                Some(0) | None => "/".to_string(),
                Some(idx) => current[..idx].to_string(),
            };
        }
    }

    pub fn has_permission(&self, perm: Permission, path: &str) -> bool {
        let granted = self.permissions_for(path);
        granted.contains(&Permission::Any) || granted.contains(&perm)
    }
}
