//! Filesystem facade
//!
//! Presents one operation set to the SFTP router and the exec commands and
//! maps it onto the configured backend. Every user path is cleaned relative
//! to `/` inside the user's view and composed with the user's key prefix, so
//! a tenant can never address anything outside its sandbox.

pub mod local;
pub mod memory;
pub mod object;

pub use local::LocalFs;
pub use memory::MemoryObjectStore;
pub use object::{ObjectFs, ObjectInfo, ObjectStore};

use crate::actions::ActionHandler;
use crate::config::{SetstatMode, UploadMode};
use crate::error::{Error, Result};
use crate::protocol::{mode, FileAttrs};
use async_trait::async_trait;
use std::sync::Arc;
use storm_petrel_core::{StorageKind, User};

/// Name of the per-user staging directory kept under the home directory.
pub const STAGING_DIR_NAME: &str = ".staging";

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// Backend-independent file metadata.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits without the file-type bits.
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Permission word including the file-type bits.
    pub fn mode_bits(&self) -> u32 {
        let kind = match self.kind {
            FileKind::File => mode::S_IFREG,
            FileKind::Dir => mode::S_IFDIR,
            FileKind::Symlink => mode::S_IFLNK,
        };
        kind | (self.permissions & 0o7777)
    }

    pub fn to_attrs(&self) -> FileAttrs {
        FileAttrs {
            size: Some(self.size),
            uid: Some(self.uid),
            gid: Some(self.gid),
            permissions: Some(self.mode_bits()),
            atime: Some(self.atime.unwrap_or_default()),
            mtime: Some(self.mtime.unwrap_or_default()),
        }
    }
}

/// Metadata changes requested by a SETSTAT.
#[derive(Debug, Clone, Default)]
pub struct SetStat {
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub size: Option<u64>,
}

/// Open-for-write disposition derived from the client's OPEN flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

/// Random-access read handle.
#[async_trait]
pub trait FsReader: Send {
    /// Read up to `len` bytes at `offset`; an empty result means EOF.
    async fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>>;
}

/// Write handle. `commit` finalizes the upload according to the configured
/// upload mode; `abort` is called when the transfer is cut short.
#[async_trait]
pub trait FsWriter: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn abort(&mut self) -> Result<()>;
}

/// Uniform per-user filesystem operations consumed by the request router.
#[async_trait]
pub trait VirtualFs: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Ensure the user's root and staging directory exist. Called once after
    /// login, before the first operation.
    async fn check_root(&self) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;
    async fn lstat(&self, path: &str) -> Result<FileInfo>;
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn FsReader>>;
    async fn open_write(&self, path: &str, opts: WriteOptions) -> Result<Box<dyn FsWriter>>;

    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn make_dir(&self, path: &str) -> Result<()>;
    async fn remove_dir(&self, path: &str) -> Result<()>;
    async fn set_stat(&self, path: &str, changes: &SetStat) -> Result<()>;

    async fn read_link(&self, path: &str) -> Result<String>;
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;
}

/// Write-once policy snapshot handed to backends at login.
#[derive(Debug, Clone)]
pub struct FsSettings {
    pub upload_mode: UploadMode,
    pub setstat_mode: SetstatMode,
    pub umask: u32,
    pub part_size: usize,
}

impl Default for FsSettings {
    fn default() -> Self {
        FsSettings {
            upload_mode: UploadMode::Direct,
            setstat_mode: SetstatMode::Apply,
            umask: crate::config::DEFAULT_UMASK,
            part_size: 5 * 1024 * 1024,
        }
    }
}

/// Backend factory: builds the per-connection filesystem handle for a user.
pub fn build_filesystem(
    user: &User,
    connection_id: &str,
    settings: FsSettings,
    object_store: Option<Arc<dyn ObjectStore>>,
    actions: Arc<ActionHandler>,
) -> Result<Arc<dyn VirtualFs>> {
    match user.storage {
        StorageKind::Local => Ok(Arc::new(LocalFs::new(
            user.clone(),
            connection_id.to_string(),
            settings,
            actions,
        ))),
        StorageKind::Object => {
            let store = object_store.ok_or_else(|| {
                Error::Config(format!(
                    "user {:?} selects object storage but no object store is configured",
                    user.username
                ))
            })?;
            Ok(Arc::new(ObjectFs::new(
                user.clone(),
                connection_id.to_string(),
                settings,
                store,
                actions,
            )))
        }
    }
}

/// Normalize a client-supplied path to an absolute virtual path. `.` and
/// `..` are resolved lexically and can never climb above `/`, which is what
/// makes the key-prefix sandbox airtight.
pub fn clean_virtual_path(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(Error::invalid_path("path contains NUL byte"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Compose the user's key prefix with a cleaned virtual path, yielding the
/// backend-relative path (no leading slash).
pub fn apply_key_prefix(key_prefix: &str, clean_path: &str) -> String {
    let prefix = key_prefix.trim_matches('/');
    let rel = clean_path.trim_start_matches('/');
    match (prefix.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, rel),
    }
}
