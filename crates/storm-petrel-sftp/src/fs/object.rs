//! Object-store backend
//!
//! Maps the facade onto a flat key namespace behind the [`ObjectStore`]
//! contract (an S3-compatible driver in production, an in-memory store in
//! tests). Directories are zero-byte marker objects with a trailing slash;
//! directories implied only by deeper keys are treated as existing.
//!
//! Semantics differ from local disk where the storage model forces it:
//! uploads are sequential multipart writes and implicitly atomic (the upload
//! mode flag is ignored, nothing is visible until completion), rename is
//! copy-plus-delete, renaming non-empty directories / symlinks / chtimes are
//! unsupported, and chmod/chown are silently ignored.

use super::{
    apply_key_prefix, clean_virtual_path, FileInfo, FileKind, FsReader, FsSettings, FsWriter,
    SetStat, VirtualFs, WriteOptions, STAGING_DIR_NAME,
};
use crate::actions::{ActionEvent, ActionHandler};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use storm_petrel_core::User;
use tracing::debug;

/// Metadata for one stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Seconds since the epoch.
    pub last_modified: Option<u32>,
}

/// External object-storage driver contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;
    /// Read `len` bytes starting at `offset`; short reads at EOF are fine.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>>;
    /// Single-shot put for small objects.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn create_multipart(&self, key: &str) -> Result<String>;
    /// Returns the part's etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String>;
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> Result<()>;
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
    /// Server-side copy.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Read-ahead window for ranged GETs; SFTP clients read in 32 KiB pieces and
/// a round-trip per piece would crawl.
const READAHEAD: u64 = 256 * 1024;

const FILE_PERMISSIONS: u32 = 0o644;
const DIR_PERMISSIONS: u32 = 0o755;

pub struct ObjectFs {
    user: User,
    connection_id: String,
    settings: FsSettings,
    store: Arc<dyn ObjectStore>,
    actions: Arc<ActionHandler>,
}

impl ObjectFs {
    pub fn new(
        user: User,
        connection_id: String,
        settings: FsSettings,
        store: Arc<dyn ObjectStore>,
        actions: Arc<ActionHandler>,
    ) -> Self {
        Self {
            user,
            connection_id,
            settings,
            store,
            actions,
        }
    }

    /// Backend key for a client path; empty string addresses the root.
    fn key(&self, path: &str) -> Result<String> {
        let clean = clean_virtual_path(path)?;
        Ok(apply_key_prefix(&self.user.key_prefix, &clean))
    }

    fn marker(key: &str) -> String {
        format!("{}/", key)
    }

    fn child_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }

    fn dir_info(name: String, mtime: Option<u32>) -> FileInfo {
        FileInfo {
            name,
            kind: FileKind::Dir,
            size: 0,
            permissions: DIR_PERMISSIONS,
            uid: 0,
            gid: 0,
            atime: mtime,
            mtime,
        }
    }

    fn file_info(name: String, object: &ObjectInfo) -> FileInfo {
        FileInfo {
            name,
            kind: FileKind::File,
            size: object.size,
            permissions: FILE_PERMISSIONS,
            uid: 0,
            gid: 0,
            atime: object.last_modified,
            mtime: object.last_modified,
        }
    }

    fn leaf_name(key: &str) -> String {
        key.rsplit('/').next().unwrap_or(key).to_string()
    }

    /// Does anything exist under `key/`, marker aside?
    async fn has_children(&self, key: &str) -> Result<bool> {
        let prefix = Self::child_prefix(key);
        let marker = Self::marker(key);
        Ok(self
            .store
            .list(&prefix)
            .await?
            .iter()
            .any(|o| o.key != marker))
    }

    async fn is_dir(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(true);
        }
        if self.store.head(&Self::marker(key)).await?.is_some() {
            return Ok(true);
        }
        self.has_children(key).await
    }
}

#[async_trait]
impl VirtualFs for ObjectFs {
    fn backend_name(&self) -> &'static str {
        "object"
    }

    async fn check_root(&self) -> Result<()> {
        debug!(
            "object backend for {:?} (connection {}): prefix {:?}",
            self.user.username, self.connection_id, self.user.key_prefix
        );
        // staging space on local disk is required regardless of backend
        let staging = self.user.home_dir.join(STAGING_DIR_NAME);
        tokio::fs::create_dir_all(&staging).await?;

        let root_key = self.key("/")?;
        if !root_key.is_empty() && self.store.head(&Self::marker(&root_key)).await?.is_none() {
            self.store.put(&Self::marker(&root_key), Vec::new()).await?;
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let key = self.key(path)?;
        if key.is_empty() {
            return Ok(Self::dir_info("/".to_string(), None));
        }
        if let Some(object) = self.store.head(&key).await? {
            return Ok(Self::file_info(Self::leaf_name(&key), &object));
        }
        if self.is_dir(&key).await? {
            let marker = self.store.head(&Self::marker(&key)).await?;
            return Ok(Self::dir_info(
                Self::leaf_name(&key),
                marker.and_then(|m| m.last_modified),
            ));
        }
        Err(Error::not_found(path))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        // no symlinks in a flat keyspace
        self.stat(path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let key = self.key(path)?;
        if !self.is_dir(&key).await? {
            return Err(Error::not_found(path));
        }

        let prefix = Self::child_prefix(&key);
        let mut files: BTreeMap<String, FileInfo> = BTreeMap::new();
        let mut dirs: BTreeMap<String, Option<u32>> = BTreeMap::new();

        for object in self.store.list(&prefix).await? {
            let rel = &object.key[prefix.len()..];
            if rel.is_empty() {
                continue; // our own marker
            }
            match rel.split_once('/') {
                None => {
                    files.insert(
                        rel.to_string(),
                        Self::file_info(rel.to_string(), &object),
                    );
                }
                Some((dir, rest)) => {
                    let entry = dirs.entry(dir.to_string()).or_insert(None);
                    if rest.is_empty() {
                        // explicit marker carries the directory mtime
                        *entry = object.last_modified;
                    }
                }
            }
        }

        let mut entries: Vec<FileInfo> = Vec::with_capacity(files.len() + dirs.len());
        for (name, mtime) in dirs {
            entries.push(Self::dir_info(name, mtime));
        }
        entries.extend(files.into_values());
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn FsReader>> {
        let key = self.key(path)?;
        let object = self
            .store
            .head(&key)
            .await?
            .ok_or_else(|| Error::not_found(path))?;
        self.actions
            .notify(ActionEvent::Download, &self.user.username, path, "");
        Ok(Box::new(ObjectReader {
            store: Arc::clone(&self.store),
            key,
            size: object.size,
            window_start: 0,
            window: Vec::new(),
        }))
    }

    async fn open_write(&self, path: &str, opts: WriteOptions) -> Result<Box<dyn FsWriter>> {
        let key = self.key(path)?;
        if opts.append {
            return Err(Error::unsupported(
                "resuming uploads is not supported on object storage",
            ));
        }
        if opts.exclusive && self.store.head(&key).await?.is_some() {
            return Err(Error::Storage(format!("object {:?} already exists", path)));
        }

        // the upload-mode flag is ignored: multipart uploads are invisible
        // until completed, so every upload is atomic here
        Ok(Box::new(ObjectWriter {
            store: Arc::clone(&self.store),
            actions: Arc::clone(&self.actions),
            username: self.user.username.clone(),
            virtual_path: clean_virtual_path(path)?,
            key,
            part_size: self.settings.part_size,
            buffer: Vec::new(),
            written: 0,
            upload_id: None,
            parts: Vec::new(),
            next_part: 1,
            done: false,
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        if self.store.head(&key).await?.is_none() {
            return Err(Error::not_found(path));
        }
        self.store.delete(&key).await?;
        self.actions
            .notify(ActionEvent::Delete, &self.user.username, path, "");
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_key = self.key(from)?;
        let to_key = self.key(to)?;

        if self.store.head(&from_key).await?.is_some() {
            // plain object: server-side copy, then delete; not atomic
            self.store.copy(&from_key, &to_key).await?;
            self.store.delete(&from_key).await?;
            self.actions
                .notify(ActionEvent::Rename, &self.user.username, from, to);
            return Ok(());
        }

        if self.is_dir(&from_key).await? {
            if self.has_children(&from_key).await? {
                return Err(Error::unsupported(
                    "renaming non-empty directories is not supported on object storage",
                ));
            }
            if self.store.head(&Self::marker(&from_key)).await?.is_some() {
                self.store.delete(&Self::marker(&from_key)).await?;
            }
            self.store.put(&Self::marker(&to_key), Vec::new()).await?;
            self.actions
                .notify(ActionEvent::Rename, &self.user.username, from, to);
            return Ok(());
        }

        Err(Error::not_found(from))
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        if key.is_empty() || self.is_dir(&key).await? || self.store.head(&key).await?.is_some() {
            return Err(Error::Storage(format!("{:?} already exists", path)));
        }
        self.store.put(&Self::marker(&key), Vec::new()).await
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        if key.is_empty() {
            return Err(Error::permission_denied("cannot remove the root"));
        }
        let has_marker = self.store.head(&Self::marker(&key)).await?.is_some();
        if !has_marker && !self.has_children(&key).await? {
            return Err(Error::not_found(path));
        }
        if self.has_children(&key).await? {
            return Err(Error::Storage(format!("directory {:?} is not empty", path)));
        }
        if has_marker {
            self.store.delete(&Self::marker(&key)).await?;
        }
        Ok(())
    }

    async fn set_stat(&self, path: &str, changes: &SetStat) -> Result<()> {
        let key = self.key(path)?;
        if self.store.head(&key).await?.is_none() && !self.is_dir(&key).await? {
            return Err(Error::not_found(path));
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            return Err(Error::unsupported(
                "changing times is not supported on object storage",
            ));
        }
        if changes.size.is_some() {
            return Err(Error::unsupported(
                "truncation is not supported on object storage",
            ));
        }
        // chmod / chown: silently ignored, objects carry no mode
        Ok(())
    }

    async fn read_link(&self, _path: &str) -> Result<String> {
        Err(Error::unsupported(
            "symlinks are not supported on object storage",
        ))
    }

    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::unsupported(
            "symlinks are not supported on object storage",
        ))
    }
}

struct ObjectReader {
    store: Arc<dyn ObjectStore>,
    key: String,
    size: u64,
    window_start: u64,
    window: Vec<u8>,
}

#[async_trait]
impl FsReader for ObjectReader {
    async fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(self.size - offset);

        let window_end = self.window_start + self.window.len() as u64;
        if offset < self.window_start || offset + len > window_end {
            let fetch = len.max(READAHEAD).min(self.size - offset);
            self.window = self.store.get_range(&self.key, offset, fetch).await?;
            self.window_start = offset;
        }

        let start = (offset - self.window_start) as usize;
        let end = (start + len as usize).min(self.window.len());
        Ok(self.window[start..end].to_vec())
    }
}

struct ObjectWriter {
    store: Arc<dyn ObjectStore>,
    actions: Arc<ActionHandler>,
    username: String,
    virtual_path: String,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    written: u64,
    upload_id: Option<String>,
    parts: Vec<(u32, String)>,
    next_part: u32,
    done: bool,
}

impl ObjectWriter {
    async fn flush_part(&mut self, data: Vec<u8>) -> Result<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self.store.create_multipart(&self.key).await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        let number = self.next_part;
        self.next_part += 1;
        let etag = self
            .store
            .upload_part(&self.key, &upload_id, number, data)
            .await?;
        self.parts.push((number, etag));
        Ok(())
    }
}

#[async_trait]
impl FsWriter for ObjectWriter {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset != self.written {
            return Err(Error::unsupported(
                "out-of-order writes are not supported on object storage",
            ));
        }
        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;

        while self.buffer.len() >= self.part_size {
            let part: Vec<u8> = self.buffer.drain(..self.part_size).collect();
            self.flush_part(part).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        match self.upload_id.take() {
            None => {
                // small upload: one put covers it, zero-byte files included
                let data = std::mem::take(&mut self.buffer);
                self.store.put(&self.key, data).await?;
            }
            Some(id) => {
                if !self.buffer.is_empty() {
                    self.upload_id = Some(id.clone());
                    let tail = std::mem::take(&mut self.buffer);
                    self.flush_part(tail).await?;
                    self.upload_id = None;
                }
                let parts = std::mem::take(&mut self.parts);
                self.store.complete_multipart(&self.key, &id, parts).await?;
            }
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
        if let Some(id) = self.upload_id.take() {
            self.store.abort_multipart(&self.key, &id).await?;
        }
        // nothing was visible at the target key, nothing to clean up
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_and_child_prefix() {
        assert_eq!(ObjectFs::marker("a/b"), "a/b/");
        assert_eq!(ObjectFs::child_prefix("a/b"), "a/b/");
        assert_eq!(ObjectFs::child_prefix(""), "");
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(ObjectFs::leaf_name("a/b/c.txt"), "c.txt");
        assert_eq!(ObjectFs::leaf_name("c.txt"), "c.txt");
    }
}
