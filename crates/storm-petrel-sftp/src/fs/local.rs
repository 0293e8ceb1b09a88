//! Local-disk backend
//!
//! Maps the facade onto the user's home directory. Uploads honor the
//! configured upload mode: direct writes, atomic rename via a sibling
//! temporary, or atomic with the temporary promoted to the target on error
//! so a later session can resume.

use super::{
    apply_key_prefix, clean_virtual_path, FileInfo, FileKind, FsReader, FsSettings, FsWriter,
    SetStat, VirtualFs, WriteOptions, STAGING_DIR_NAME,
};
use crate::actions::{ActionEvent, ActionHandler};
use crate::config::{SetstatMode, UploadMode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storm_petrel_core::User;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

pub struct LocalFs {
    user: User,
    connection_id: String,
    settings: FsSettings,
    actions: Arc<ActionHandler>,
    temp_seq: AtomicU64,
}

impl LocalFs {
    pub fn new(
        user: User,
        connection_id: String,
        settings: FsSettings,
        actions: Arc<ActionHandler>,
    ) -> Self {
        Self {
            user,
            connection_id,
            settings,
            actions,
            temp_seq: AtomicU64::new(0),
        }
    }

    /// Resolve a client path to the on-disk location inside the sandbox.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let clean = clean_virtual_path(path)?;
        let rel = apply_key_prefix(&self.user.key_prefix, &clean);
        if rel.is_empty() {
            Ok(self.user.home_dir.clone())
        } else {
            Ok(self.user.home_dir.join(rel))
        }
    }

    fn file_mode(&self) -> u32 {
        0o666 & !self.settings.umask
    }

    fn dir_mode(&self) -> u32 {
        0o777 & !self.settings.umask
    }

    /// Sibling temporary used by the atomic upload modes.
    fn temp_sibling(&self, target: &Path) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.{}.{}.part", name, self.connection_id, seq))
    }

    fn info_from_metadata(name: String, metadata: &std::fs::Metadata) -> FileInfo {
        let kind = if metadata.is_dir() {
            FileKind::Dir
        } else if metadata.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };

        #[cfg(unix)]
        let (permissions, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
        };
        #[cfg(not(unix))]
        let (permissions, uid, gid) = (if metadata.permissions().readonly() { 0o444 } else { 0o644 }, 0, 0);

        let to_epoch = |time: std::io::Result<std::time::SystemTime>| {
            time.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
        };

        FileInfo {
            name,
            kind,
            size: metadata.len(),
            permissions,
            uid,
            gid,
            atime: to_epoch(metadata.accessed()),
            mtime: to_epoch(metadata.modified()),
        }
    }
}

#[async_trait]
impl VirtualFs for LocalFs {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn check_root(&self) -> Result<()> {
        let root = self.resolve("/")?;
        if !root.exists() {
            debug!("creating root directory {:?} for {:?}", root, self.user.username);
            fs::create_dir_all(&root).await?;
        }
        let staging = self.user.home_dir.join(STAGING_DIR_NAME);
        fs::create_dir_all(&staging).await?;

        #[cfg(unix)]
        {
            // root ownership follows the user record; failure is expected
            // when the server does not run as root
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;
            if self.user.uid != 0 || self.user.gid != 0 {
                if let Ok(path_c) = CString::new(root.as_os_str().as_bytes()) {
                    let rc = unsafe {
                        libc::chown(path_c.as_ptr(), self.user.uid, self.user.gid)
                    };
                    if rc != 0 {
                        debug!(
                            "chown {:?} to {}:{} failed: {}",
                            root,
                            self.user.uid,
                            self.user.gid,
                            std::io::Error::last_os_error()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let resolved = self.resolve(path)?;
        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|_| Error::not_found(path))?;
        let name = file_name(&resolved);
        Ok(Self::info_from_metadata(name, &metadata))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|_| Error::not_found(path))?;
        let name = file_name(&resolved);
        Ok(Self::info_from_metadata(name, &metadata))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let resolved = self.resolve(path)?;
        let mut read_dir = fs::read_dir(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                Error::Io(e)
            }
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // the staging directory is infrastructure, not user data
            if name == STAGING_DIR_NAME && clean_virtual_path(path)? == "/" {
                continue;
            }
            match fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => entries.push(Self::info_from_metadata(name, &metadata)),
                Err(err) => debug!("skipping unreadable entry {:?}: {}", name, err),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn FsReader>> {
        let resolved = self.resolve(path)?;
        let file = fs::File::open(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                Error::Io(e)
            }
        })?;
        self.actions.notify(
            ActionEvent::Download,
            &self.user.username,
            path,
            "",
        );
        Ok(Box::new(LocalReader { file, pos: 0 }))
    }

    async fn open_write(&self, path: &str, opts: WriteOptions) -> Result<Box<dyn FsWriter>> {
        let target = self.resolve(path)?;

        // Atomic modes stage fresh uploads in a sibling temporary. Appends
        // and offset rewrites must hit the final path directly or resumed
        // uploads would start from an empty file.
        let staged = self.settings.upload_mode != UploadMode::Direct
            && opts.truncate
            && !opts.append;

        let open_path = if staged {
            self.temp_sibling(&target)
        } else {
            target.clone()
        };

        let mut options = fs::OpenOptions::new();
        options.write(true);
        if opts.append {
            options.append(true);
        }
        if staged || opts.create {
            options.create(true);
        }
        if opts.truncate || staged {
            options.truncate(true);
        }
        if opts.exclusive {
            options.create_new(true);
        }
        #[cfg(unix)]
        options.mode(self.file_mode());

        let file = options.open(&open_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path),
            _ => Error::Io(e),
        })?;

        Ok(Box::new(LocalWriter {
            file: Some(file),
            target,
            temp: if staged { Some(open_path) } else { None },
            upload_mode: self.settings.upload_mode,
            actions: Arc::clone(&self.actions),
            username: self.user.username.clone(),
            virtual_path: clean_virtual_path(path)?,
            done: false,
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::remove_file(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                Error::Io(e)
            }
        })?;
        self.actions
            .notify(ActionEvent::Delete, &self.user.username, path, "");
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        fs::rename(&src, &dst).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(from)
            } else {
                Error::Io(e)
            }
        })?;
        self.actions
            .notify(ActionEvent::Rename, &self.user.username, from, to);
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::create_dir(&resolved).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(self.dir_mode());
            fs::set_permissions(&resolved, perms).await?;
        }
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::remove_dir(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                // non-empty directories land here
                Error::Io(e)
            }
        })
    }

    async fn set_stat(&self, path: &str, changes: &SetStat) -> Result<()> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(Error::not_found(path));
        }

        if self.settings.setstat_mode == SetstatMode::Ignore {
            debug!("setstat ignored for {:?} by policy", path);
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(permissions) = changes.permissions {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(permissions & 0o7777);
            fs::set_permissions(&resolved, perms).await?;
        }

        #[cfg(unix)]
        if changes.uid.is_some() || changes.gid.is_some() {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;
            use std::os::unix::fs::MetadataExt;

            let metadata = fs::metadata(&resolved).await?;
            let uid = changes.uid.unwrap_or(metadata.uid());
            let gid = changes.gid.unwrap_or(metadata.gid());
            let path_c = CString::new(resolved.as_os_str().as_bytes())
                .map_err(|_| Error::invalid_path("path contains NUL byte"))?;
            let rc = unsafe { libc::chown(path_c.as_ptr(), uid, gid) };
            if rc != 0 {
                // chown needs privileges we usually do not have
                warn!(
                    "chown {:?} to {}:{} failed: {}",
                    resolved,
                    uid,
                    gid,
                    std::io::Error::last_os_error()
                );
            }
        }

        #[cfg(unix)]
        if changes.atime.is_some() || changes.mtime.is_some() {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;

            let current = fs::metadata(&resolved).await?;
            let fallback = |t: std::io::Result<std::time::SystemTime>| {
                t.ok()
                    .and_then(|v| v.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            };
            let atime = changes
                .atime
                .map(|t| t as i64)
                .unwrap_or_else(|| fallback(current.accessed()));
            let mtime = changes
                .mtime
                .map(|t| t as i64)
                .unwrap_or_else(|| fallback(current.modified()));

            let path_c = CString::new(resolved.as_os_str().as_bytes())
                .map_err(|_| Error::invalid_path("path contains NUL byte"))?;
            let times = [
                libc::timeval {
                    tv_sec: atime,
                    tv_usec: 0,
                },
                libc::timeval {
                    tv_sec: mtime,
                    tv_usec: 0,
                },
            ];
            let rc = unsafe { libc::utimes(path_c.as_ptr(), times.as_ptr()) };
            if rc != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }

        if let Some(size) = changes.size {
            let file = fs::OpenOptions::new().write(true).open(&resolved).await?;
            file.set_len(size).await?;
        }

        Ok(())
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path)?;
        let target = fs::read_link(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(target.to_string_lossy().to_string())
    }

    #[cfg(unix)]
    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        // the link target is resolved inside the sandbox as well, so a user
        // cannot point a link at another tenant's tree
        let target_resolved = self.resolve(target)?;
        let link_resolved = self.resolve(link)?;
        fs::symlink(&target_resolved, &link_resolved).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::unsupported("symlinks on this platform"))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "/".to_string())
}

struct LocalReader {
    file: fs::File,
    pos: u64,
}

#[async_trait]
impl FsReader for LocalReader {
    async fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if offset != self.pos {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.pos = offset;
        }
        let mut buf = vec![0u8; len as usize];
        let n = self.file.read(&mut buf).await?;
        buf.truncate(n);
        self.pos += n as u64;
        Ok(buf)
    }
}

struct LocalWriter {
    file: Option<fs::File>,
    target: PathBuf,
    temp: Option<PathBuf>,
    upload_mode: UploadMode,
    actions: Arc<ActionHandler>,
    username: String,
    virtual_path: String,
    done: bool,
}

#[async_trait]
impl FsWriter for LocalWriter {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("write after close".to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        if let Some(temp) = self.temp.take() {
            fs::rename(&temp, &self.target).await?;
        }
        self.actions
            .notify(ActionEvent::Upload, &self.username, &self.virtual_path, "");
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        drop(self.file.take());

        if let Some(temp) = self.temp.take() {
            match self.upload_mode {
                // the target path never sees a partial file
                UploadMode::Atomic => {
                    if let Err(err) = fs::remove_file(&temp).await {
                        warn!("unable to remove temporary upload {:?}: {}", temp, err);
                    }
                }
                // the partial file is promoted so the client can resume
                UploadMode::AtomicWithResume => {
                    if let Err(err) = fs::rename(&temp, &self.target).await {
                        warn!(
                            "unable to keep partial upload {:?} at {:?}: {}",
                            temp, self.target, err
                        );
                    }
                }
                UploadMode::Direct => {}
            }
        }
        Ok(())
    }
}
