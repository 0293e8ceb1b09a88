//! SFTP request router
//!
//! Channel-agnostic engine: the server feeds it raw channel bytes and sends
//! back whatever response frames it returns. Each request is checked against
//! the user's permission map, delegated to the filesystem facade and answered
//! with a protocol reply; facade errors become SFTP status codes. Every
//! served request refreshes the connection's activity stamp.

use crate::connection::ActivityTracker;
use crate::error::{Error, Result};
use crate::fs::{FileInfo, FsReader, FsWriter, SetStat, VirtualFs, WriteOptions};
use crate::protocol::{
    self, codec, encode_packet, format_longname, FileAttrs, MessageType, OpenFlags, Packet,
    StatusCode, EXTENSIONS, EXT_POSIX_RENAME, SFTP_VERSION,
};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use storm_petrel_core::{Permission, User};
use tracing::{debug, warn};

/// Open handles per channel; a client holding more is misbehaving.
const MAX_HANDLES: usize = 256;

/// Directory entries returned per READDIR round.
const READDIR_CHUNK: usize = 100;

enum EngineHandle {
    Reader {
        reader: Box<dyn FsReader>,
        path: String,
    },
    Writer {
        writer: Box<dyn FsWriter>,
        path: String,
    },
    Dir {
        entries: Vec<FileInfo>,
        index: usize,
    },
}

/// Per-channel SFTP state. One engine serves exactly one bound channel.
pub struct SftpEngine {
    fs: Arc<dyn VirtualFs>,
    user: User,
    activity: ActivityTracker,
    buffer: BytesMut,
    handles: HashMap<String, EngineHandle>,
    next_handle: u32,
    initialized: bool,
}

impl SftpEngine {
    pub fn new(fs: Arc<dyn VirtualFs>, user: User, activity: ActivityTracker) -> Self {
        Self {
            fs,
            user,
            activity,
            buffer: BytesMut::new(),
            handles: HashMap::new(),
            next_handle: 0,
            initialized: false,
        }
    }

    /// Feed channel bytes in; get complete response frames out. Protocol
    /// errors (bad framing, junk types) are returned as `Err` and tear the
    /// channel down; per-request failures come back as STATUS replies.
    pub async fn input(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        let mut responses = Vec::new();
        while let Some(packet) = protocol::next_packet(&mut self.buffer)? {
            self.activity.touch();
            responses.push(self.handle_packet(packet).await?);
        }
        Ok(responses)
    }

    /// Abort in-flight uploads and drop all handles. Called when the channel
    /// or connection goes away; upload-mode policy decides what survives of
    /// partial uploads.
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let EngineHandle::Writer { mut writer, path } = handle {
                debug!("aborting in-flight upload for {:?}", path);
                if let Err(err) = writer.abort().await {
                    warn!("error aborting upload for {:?}: {}", path, err);
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Vec<u8>> {
        if !self.initialized && packet.msg_type != MessageType::Init {
            return Err(Error::protocol("request before SSH_FXP_INIT"));
        }

        let mut buf = packet.payload.as_slice();
        match packet.msg_type {
            MessageType::Init => self.handle_init(&mut buf),
            MessageType::Open => self.handle_open(&mut buf).await,
            MessageType::Close => self.handle_close(&mut buf).await,
            MessageType::Read => self.handle_read(&mut buf).await,
            MessageType::Write => self.handle_write(&mut buf).await,
            MessageType::Stat | MessageType::Lstat => {
                self.handle_stat(&mut buf, packet.msg_type).await
            }
            MessageType::Fstat => self.handle_fstat(&mut buf).await,
            MessageType::Setstat => self.handle_setstat(&mut buf).await,
            MessageType::Fsetstat => self.handle_fsetstat(&mut buf).await,
            MessageType::Opendir => self.handle_opendir(&mut buf).await,
            MessageType::Readdir => self.handle_readdir(&mut buf),
            MessageType::Remove => self.handle_remove(&mut buf).await,
            MessageType::Mkdir => self.handle_mkdir(&mut buf).await,
            MessageType::Rmdir => self.handle_rmdir(&mut buf).await,
            MessageType::Realpath => self.handle_realpath(&mut buf).await,
            MessageType::Rename => self.handle_rename(&mut buf).await,
            MessageType::Readlink => self.handle_readlink(&mut buf).await,
            MessageType::Symlink => self.handle_symlink(&mut buf).await,
            MessageType::Extended => self.handle_extended(&mut buf).await,
            other => {
                // a well-formed but unsupported request gets a negative
                // reply, not a teardown
                let request_id = codec::get_u32(&mut buf).unwrap_or(0);
                debug!("unsupported request {:?}", other);
                Ok(status(request_id, StatusCode::OpUnsupported, "not supported"))
            }
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let version = codec::get_u32(buf)?;
        debug!("client requested SFTP version {}", version);
        self.initialized = true;

        let mut body = BytesMut::new();
        body.put_u32(SFTP_VERSION);
        for &(name, value) in EXTENSIONS {
            codec::put_string(&mut body, name);
            codec::put_string(&mut body, value);
        }
        Ok(encode_packet(MessageType::Version, &body))
    }

    async fn handle_open(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            return Ok(status(request_id, StatusCode::Failure, "too many open handles"));
        }

        if flags.has_write() {
            let required = if self.fs.stat(&path).await.is_ok() {
                Permission::Overwrite
            } else {
                Permission::Upload
            };
            if !self.user.has_permission(required, &path) {
                return Ok(denied(request_id));
            }
            let opts = WriteOptions {
                append: flags.has_append(),
                create: flags.has_creat(),
                truncate: flags.has_trunc(),
                exclusive: flags.has_excl(),
            };
            match self.fs.open_write(&path, opts).await {
                Ok(writer) => {
                    let id = self.allocate(EngineHandle::Writer { writer, path });
                    Ok(handle_reply(request_id, &id))
                }
                Err(err) => Ok(error_status(request_id, &err)),
            }
        } else {
            if !self.user.has_permission(Permission::Download, &path) {
                return Ok(denied(request_id));
            }
            match self.fs.open_read(&path).await {
                Ok(reader) => {
                    let id = self.allocate(EngineHandle::Reader { reader, path });
                    Ok(handle_reply(request_id, &id))
                }
                Err(err) => Ok(error_status(request_id, &err)),
            }
        }
    }

    async fn handle_close(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;

        match self.handles.remove(&handle_id) {
            None => Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
            Some(EngineHandle::Writer { mut writer, path }) => {
                // a clean close is a completed upload
                match writer.commit().await {
                    Ok(()) => Ok(ok_status(request_id)),
                    Err(err) => {
                        warn!("error finalizing upload for {:?}: {}", path, err);
                        Ok(error_status(request_id, &err))
                    }
                }
            }
            Some(_) => Ok(ok_status(request_id)),
        }
    }

    async fn handle_read(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?;

        match self.handles.get_mut(&handle_id) {
            Some(EngineHandle::Reader { reader, .. }) => {
                match reader.read_at(offset, len).await {
                    Ok(data) if data.is_empty() => {
                        Ok(status(request_id, StatusCode::Eof, "end of file"))
                    }
                    Ok(data) => Ok(data_reply(request_id, &data)),
                    Err(err) => Ok(error_status(request_id, &err)),
                }
            }
            Some(_) => Ok(status(request_id, StatusCode::BadMessage, "not a file handle")),
            None => Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
        }
    }

    async fn handle_write(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        match self.handles.get_mut(&handle_id) {
            Some(EngineHandle::Writer { writer, .. }) => {
                match writer.write_at(offset, &data).await {
                    Ok(()) => Ok(ok_status(request_id)),
                    Err(err) => Ok(error_status(request_id, &err)),
                }
            }
            Some(_) => Ok(status(request_id, StatusCode::BadMessage, "not a file handle")),
            None => Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
        }
    }

    async fn handle_stat(&mut self, buf: &mut &[u8], msg_type: MessageType) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::List, &path) {
            return Ok(denied(request_id));
        }

        let result = if msg_type == MessageType::Lstat {
            self.fs.lstat(&path).await
        } else {
            self.fs.stat(&path).await
        };
        match result {
            Ok(info) => Ok(attrs_reply(request_id, &info.to_attrs())),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;

        let path = match self.handles.get(&handle_id) {
            Some(EngineHandle::Reader { path, .. }) | Some(EngineHandle::Writer { path, .. }) => {
                path.clone()
            }
            _ => return Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
        };
        match self.fs.stat(&path).await {
            Ok(info) => Ok(attrs_reply(request_id, &info.to_attrs())),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        match self.fs.set_stat(&path, &setstat_from(&attrs)).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        let path = match self.handles.get(&handle_id) {
            Some(EngineHandle::Reader { path, .. }) | Some(EngineHandle::Writer { path, .. }) => {
                path.clone()
            }
            _ => return Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
        };
        match self.fs.set_stat(&path, &setstat_from(&attrs)).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::List, &path) {
            return Ok(denied(request_id));
        }
        if self.handles.len() >= MAX_HANDLES {
            return Ok(status(request_id, StatusCode::Failure, "too many open handles"));
        }

        match self.fs.list_dir(&path).await {
            Ok(entries) => {
                let id = self.allocate(EngineHandle::Dir { entries, index: 0 });
                Ok(handle_reply(request_id, &id))
            }
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;

        match self.handles.get_mut(&handle_id) {
            Some(EngineHandle::Dir { entries, index }) => {
                if *index >= entries.len() {
                    return Ok(status(request_id, StatusCode::Eof, "end of directory"));
                }
                let end = (*index + READDIR_CHUNK).min(entries.len());
                let chunk = &entries[*index..end];

                let mut body = BytesMut::new();
                body.put_u32(request_id);
                body.put_u32(chunk.len() as u32);
                for info in chunk {
                    let attrs = info.to_attrs();
                    codec::put_string(&mut body, &info.name);
                    codec::put_string(&mut body, &format_longname(&info.name, &attrs));
                    body.put(attrs.encode());
                }
                *index = end;
                Ok(encode_packet(MessageType::Name, &body))
            }
            Some(_) => Ok(status(request_id, StatusCode::BadMessage, "not a directory handle")),
            None => Ok(status(request_id, StatusCode::BadMessage, "invalid handle")),
        }
    }

    async fn handle_remove(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::Delete, &path) {
            return Ok(denied(request_id));
        }
        match self.fs.remove_file(&path).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let _attrs = FileAttrs::decode(buf)?;

        if !self.user.has_permission(Permission::CreateDirs, &path) {
            return Ok(denied(request_id));
        }
        match self.fs.make_dir(&path).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_rmdir(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::Delete, &path) {
            return Ok(denied(request_id));
        }
        match self.fs.remove_dir(&path).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        let resolved = match crate::fs::clean_virtual_path(&path) {
            Ok(p) => p,
            Err(err) => return Ok(error_status(request_id, &err)),
        };
        let attrs = self
            .fs
            .stat(&resolved)
            .await
            .map(|info| info.to_attrs())
            .unwrap_or_default();

        let mut body = BytesMut::new();
        body.put_u32(request_id);
        body.put_u32(1);
        codec::put_string(&mut body, &resolved);
        codec::put_string(&mut body, &format_longname(&resolved, &attrs));
        body.put(attrs.encode());
        Ok(encode_packet(MessageType::Name, &body))
    }

    async fn handle_rename(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let from = codec::get_string(buf)?;
        let to = codec::get_string(buf)?;
        self.rename(request_id, &from, &to).await
    }

    async fn rename(&mut self, request_id: u32, from: &str, to: &str) -> Result<Vec<u8>> {
        if !self.user.has_permission(Permission::Rename, from) {
            return Ok(denied(request_id));
        }
        match self.fs.rename(from, to).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_readlink(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::List, &path) {
            return Ok(denied(request_id));
        }
        match self.fs.read_link(&path).await {
            Ok(target) => {
                let mut body = BytesMut::new();
                body.put_u32(request_id);
                body.put_u32(1);
                codec::put_string(&mut body, &target);
                codec::put_string(&mut body, &target);
                body.put(FileAttrs::default().encode());
                Ok(encode_packet(MessageType::Name, &body))
            }
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_symlink(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        // OpenSSH argument order: targetpath first, then linkpath
        let target = codec::get_string(buf)?;
        let link = codec::get_string(buf)?;

        if !self.user.has_permission(Permission::CreateSymlinks, &link) {
            return Ok(denied(request_id));
        }
        match self.fs.symlink(&target, &link).await {
            Ok(()) => Ok(ok_status(request_id)),
            Err(err) => Ok(error_status(request_id, &err)),
        }
    }

    async fn handle_extended(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let request_id = codec::get_u32(buf)?;
        let name = codec::get_string(buf)?;

        if name == EXT_POSIX_RENAME {
            let from = codec::get_string(buf)?;
            let to = codec::get_string(buf)?;
            return self.rename(request_id, &from, &to).await;
        }

        debug!("unsupported extended request {:?}", name);
        Ok(status(request_id, StatusCode::OpUnsupported, "not supported"))
    }

    fn allocate(&mut self, handle: EngineHandle) -> String {
        let id = format!("{:08x}", self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(id.clone(), handle);
        id
    }

    #[cfg(test)]
    fn open_handle_count(&self) -> usize {
        self.handles.len()
    }
}

fn setstat_from(attrs: &FileAttrs) -> SetStat {
    SetStat {
        permissions: attrs.permissions,
        uid: attrs.uid,
        gid: attrs.gid,
        atime: attrs.atime,
        mtime: attrs.mtime,
        size: attrs.size,
    }
}

fn status(request_id: u32, code: StatusCode, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(request_id);
    body.put_u32(code.into());
    codec::put_string(&mut body, message);
    codec::put_string(&mut body, "en");
    encode_packet(MessageType::Status, &body)
}

fn ok_status(request_id: u32) -> Vec<u8> {
    status(request_id, StatusCode::Ok, "success")
}

fn denied(request_id: u32) -> Vec<u8> {
    status(request_id, StatusCode::PermissionDenied, "Permission denied")
}

fn error_status(request_id: u32, err: &Error) -> Vec<u8> {
    status(request_id, err.status_code(), &err.client_message())
}

fn handle_reply(request_id: u32, handle: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(request_id);
    codec::put_string(&mut body, handle);
    encode_packet(MessageType::Handle, &body)
}

fn data_reply(request_id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(request_id);
    codec::put_bytes(&mut body, data);
    encode_packet(MessageType::Data, &body)
}

fn attrs_reply(request_id: u32, attrs: &FileAttrs) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(request_id);
    body.put(attrs.encode());
    encode_packet(MessageType::Attrs, &body)
}
