//! SFTP version 3 wire protocol
//!
//! Packet framing, message and status codes, file attributes and the
//! string/byte codec used by the request router. Packets are length framed
//! (`u32` length, type byte, payload) and may be split or coalesced across
//! SSH channel data messages, so the parser works over an accumulating
//! buffer.

use bytes::{Buf, BufMut, BytesMut};

/// Protocol version spoken by the server.
pub const SFTP_VERSION: u32 = 3;

/// Extensions advertised in the VERSION reply.
pub const EXTENSIONS: &[(&str, &str)] = &[("posix-rename@openssh.com", "1")];

/// Extended request name for POSIX rename.
pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";

/// Largest packet accepted from a client. SSH_FXP_WRITE carries at most
/// 32 KiB of payload in practice; anything past this is a framing error.
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// SFTP message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Init,
            2 => MessageType::Version,
            3 => MessageType::Open,
            4 => MessageType::Close,
            5 => MessageType::Read,
            6 => MessageType::Write,
            7 => MessageType::Lstat,
            8 => MessageType::Fstat,
            9 => MessageType::Setstat,
            10 => MessageType::Fsetstat,
            11 => MessageType::Opendir,
            12 => MessageType::Readdir,
            13 => MessageType::Remove,
            14 => MessageType::Mkdir,
            15 => MessageType::Rmdir,
            16 => MessageType::Realpath,
            17 => MessageType::Stat,
            18 => MessageType::Rename,
            19 => MessageType::Readlink,
            20 => MessageType::Symlink,
            101 => MessageType::Status,
            102 => MessageType::Handle,
            103 => MessageType::Data,
            104 => MessageType::Name,
            105 => MessageType::Attrs,
            200 => MessageType::Extended,
            201 => MessageType::ExtendedReply,
            other => {
                return Err(crate::error::Error::protocol(format!(
                    "unknown message type: {}",
                    other
                )))
            }
        })
    }
}

/// SFTP status codes (draft-ietf-secsh-filexfer-02).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// One length-framed packet pulled off the channel byte stream.
#[derive(Debug)]
pub struct Packet {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

/// Pull the next complete packet out of `buf`, leaving any trailing bytes in
/// place. Returns `Ok(None)` when more data is needed.
pub fn next_packet(buf: &mut BytesMut) -> crate::error::Result<Option<Packet>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length == 0 {
        return Err(crate::error::Error::protocol("zero-length packet"));
    }
    if length > MAX_PACKET_SIZE {
        return Err(crate::error::Error::protocol(format!(
            "packet length {} exceeds limit",
            length
        )));
    }
    if buf.len() < 4 + length as usize {
        return Ok(None);
    }

    buf.advance(4);
    let msg_type = MessageType::try_from(buf[0])?;
    buf.advance(1);
    let payload = buf.split_to(length as usize - 1).to_vec();

    Ok(Some(Packet { msg_type, payload }))
}

/// Frame an outgoing packet: length prefix, type byte, body.
pub fn encode_packet(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u32(body.len() as u32 + 1);
    out.put_u8(msg_type as u8);
    out.put_slice(body);
    out.to_vec()
}

/// File open flag bits from the OPEN request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }
    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }
    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }
    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }
    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// File attributes as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    pub fn decode(buf: &mut &[u8]) -> crate::error::Result<Self> {
        if buf.remaining() < 4 {
            return Err(crate::error::Error::protocol("truncated attr flags"));
        }

        let flags = buf.get_u32();
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(crate::error::Error::protocol("truncated attr size"));
            }
            attrs.size = Some(buf.get_u64());
        }
        if flags & Self::FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(crate::error::Error::protocol("truncated attr uid/gid"));
            }
            attrs.uid = Some(buf.get_u32());
            attrs.gid = Some(buf.get_u32());
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(crate::error::Error::protocol("truncated attr permissions"));
            }
            attrs.permissions = Some(buf.get_u32());
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(crate::error::Error::protocol("truncated attr times"));
            }
            attrs.atime = Some(buf.get_u32());
            attrs.mtime = Some(buf.get_u32());
        }

        Ok(attrs)
    }
}

/// File type bits used in the permissions word.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFLNK: u32 = 0o120000;
}

/// Render an `ls -l` style longname for a NAME entry.
pub fn format_longname(name: &str, attrs: &FileAttrs) -> String {
    let permissions = attrs.permissions.unwrap_or(0);
    let kind = match permissions & mode::S_IFMT {
        mode::S_IFDIR => 'd',
        mode::S_IFLNK => 'l',
        _ => '-',
    };

    let mut perm_str = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (permissions >> shift) & 0o7;
        perm_str.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perm_str.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perm_str.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    let mtime = attrs
        .mtime
        .map(|t| {
            chrono::DateTime::from_timestamp(t as i64, 0)
                .map(|dt| dt.format("%b %e %H:%M").to_string())
                .unwrap_or_else(|| "Jan  1 00:00".to_string())
        })
        .unwrap_or_else(|| "Jan  1 00:00".to_string());

    format!(
        "{}{} {:>4} {:<8} {:<8} {:>12} {} {}",
        kind,
        perm_str,
        1,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        mtime,
        name
    )
}

/// String and byte-string primitives shared by the SFTP codec and the
/// PROXY v2 parser.
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    pub fn get_string(buf: &mut &[u8]) -> crate::error::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::error::Error::protocol(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn get_bytes(buf: &mut &[u8]) -> crate::error::Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(crate::error::Error::protocol("truncated string length"));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(crate::error::Error::protocol("truncated string body"));
        }
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    pub fn get_u32(buf: &mut &[u8]) -> crate::error::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::error::Error::protocol("truncated u32"));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> crate::error::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::error::Error::protocol("truncated u64"));
        }
        Ok(buf.get_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_framing_round_trip() {
        let mut body = BytesMut::new();
        body.put_u32(7);
        codec::put_string(&mut body, "/tmp/x");
        let encoded = encode_packet(MessageType::Stat, &body);

        let mut buf = BytesMut::from(&encoded[..]);
        let packet = next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet.msg_type, MessageType::Stat);
        assert!(buf.is_empty());

        let mut payload = packet.payload.as_slice();
        assert_eq!(codec::get_u32(&mut payload).unwrap(), 7);
        assert_eq!(codec::get_string(&mut payload).unwrap(), "/tmp/x");
    }

    #[test]
    fn test_partial_packet_needs_more_data() {
        let encoded = encode_packet(MessageType::Init, &3u32.to_be_bytes());

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(next_packet(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 2..]);
        let packet = next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet.msg_type, MessageType::Init);
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let a = encode_packet(MessageType::Init, &3u32.to_be_bytes());
        let b = encode_packet(MessageType::Realpath, b"xxxx");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        assert_eq!(
            next_packet(&mut buf).unwrap().unwrap().msg_type,
            MessageType::Init
        );
        assert_eq!(
            next_packet(&mut buf).unwrap().unwrap().msg_type,
            MessageType::Realpath
        );
        assert!(next_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_PACKET_SIZE + 1);
        buf.put_u8(MessageType::Write as u8);
        assert!(next_packet(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(250);
        assert!(next_packet(&mut buf).is_err());
    }

    #[test]
    fn test_attrs_round_trip() {
        let attrs = FileAttrs {
            size: Some(1234),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_100),
        };
        let encoded = attrs.encode();
        let mut slice = &encoded[..];
        let decoded = FileAttrs::decode(&mut slice).unwrap();
        assert_eq!(decoded, attrs);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_attrs_partial_flags() {
        let attrs = FileAttrs {
            size: Some(10),
            ..Default::default()
        };
        let encoded = attrs.encode();
        let mut slice = &encoded[..];
        let decoded = FileAttrs::decode(&mut slice).unwrap();
        assert_eq!(decoded.size, Some(10));
        assert_eq!(decoded.permissions, None);
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
        assert!(flags.has_write());
        assert!(flags.has_creat());
        assert!(flags.has_trunc());
        assert!(!flags.has_read());
        assert!(!flags.has_excl());
    }

    #[test]
    fn test_longname_shapes() {
        let attrs = FileAttrs {
            size: Some(42),
            permissions: Some(mode::S_IFDIR | 0o755),
            uid: Some(0),
            gid: Some(0),
            mtime: Some(1_700_000_000),
            atime: Some(1_700_000_000),
        };
        let longname = format_longname("docs", &attrs);
        assert!(longname.starts_with("drwxr-xr-x"));
        assert!(longname.ends_with("docs"));

        let attrs = FileAttrs {
            permissions: Some(mode::S_IFREG | 0o600),
            ..Default::default()
        };
        assert!(format_longname("f", &attrs).starts_with("-rw-------"));
    }
}
