//! PROXY protocol front end
//!
//! Optional v1/v2 header parsing in front of the SSH handshake, governed by
//! an allow-list policy:
//!
//! - `optional`: a header is honored when present and the peer is allowed;
//!   a header from a peer outside a non-empty allow-list is consumed and
//!   ignored; connections without a header are accepted as-is.
//! - `required`: peers outside a non-empty allow-list are rejected outright;
//!   everyone else must send a valid header.
//!
//! A malformed header is an error under both policies. Bytes read past the
//! header belong to the SSH stream and are replayed through
//! [`PrefixedStream`].

use crate::config::ProxyPolicy;
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use storm_petrel_core::CidrBlock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Longest possible v1 header line including CRLF.
const V1_MAX_LEN: usize = 107;

/// A stream with a replay buffer in front: bytes consumed while probing for
/// a PROXY header but belonging to the SSH handshake are served first.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Outcome of probing the head of a connection.
#[derive(Debug, PartialEq, Eq)]
enum Header {
    /// No PROXY header present; every probed byte belongs to the SSH stream.
    Absent,
    /// Header consumed; carried no usable address (v1 UNKNOWN, v2 LOCAL).
    Local,
    /// Header consumed; carries the original client address.
    Proxied(SocketAddr),
}

/// Apply the PROXY policy to an accepted socket. Returns the stream (with
/// replay buffer) and the effective remote address.
pub async fn apply<S>(
    mut stream: S,
    policy: ProxyPolicy,
    allow_list: &[CidrBlock],
    raw_peer: SocketAddr,
) -> Result<(PrefixedStream<S>, SocketAddr)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert_ne!(policy, ProxyPolicy::Off);

    let peer_allowed = allow_list.is_empty() || CidrBlock::matches_any(allow_list, raw_peer.ip());

    if policy == ProxyPolicy::Required && !allow_list.is_empty() && !peer_allowed {
        return Err(Error::Connection(format!(
            "peer {} is not allowed to send a proxy header",
            raw_peer.ip()
        )));
    }

    let mut buf: Vec<u8> = Vec::with_capacity(V1_MAX_LEN);
    let (header, consumed) = read_header(&mut stream, &mut buf).await?;

    let effective = match header {
        Header::Absent => {
            if policy == ProxyPolicy::Required {
                return Err(Error::Connection(format!(
                    "proxy protocol header required but missing from {}",
                    raw_peer
                )));
            }
            raw_peer
        }
        Header::Local => raw_peer,
        Header::Proxied(addr) => {
            if peer_allowed {
                debug!("proxy header from {} reports client {}", raw_peer, addr);
                addr
            } else {
                // optional policy, peer outside the allow-list: header is
                // consumed but its address is not trusted
                debug!("ignoring proxy header from unlisted peer {}", raw_peer);
                raw_peer
            }
        }
    };

    let remainder = buf.split_off(consumed);
    Ok((PrefixedStream::new(remainder, stream), effective))
}

/// Read enough bytes to classify and parse any header at the head of the
/// stream. Returns the parsed header and the number of buffered bytes it
/// consumed.
async fn read_header<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> Result<(Header, usize)> {
    fill_to(stream, buf, 12).await?;
    if buf.len() < 12 {
        // the connection closed before 12 bytes arrived; nothing here can be
        // a proxy header
        return Ok((Header::Absent, 0));
    }

    if buf[..12] == V2_SIGNATURE {
        fill_to(stream, buf, 16).await?;
        if buf.len() < 16 {
            return Err(Error::protocol("truncated proxy v2 header"));
        }
        let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        fill_to(stream, buf, 16 + addr_len).await?;
        if buf.len() < 16 + addr_len {
            return Err(Error::protocol("truncated proxy v2 addresses"));
        }
        let header = parse_v2(&buf[..16 + addr_len])?;
        return Ok((header, 16 + addr_len));
    }

    if buf.starts_with(b"PROXY ") {
        // v1 is a single CRLF-terminated ASCII line
        loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                let header = parse_v1(&buf[..pos])?;
                return Ok((header, pos + 2));
            }
            if buf.len() >= V1_MAX_LEN {
                return Err(Error::protocol("proxy v1 header too long"));
            }
            let before = buf.len();
            fill_to(stream, buf, before + 1).await?;
            if buf.len() == before {
                return Err(Error::protocol("truncated proxy v1 header"));
            }
        }
    }

    Ok((Header::Absent, 0))
}

async fn fill_to<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    target: usize,
) -> Result<()> {
    let mut chunk = [0u8; 256];
    while buf.len() < target {
        let want = (target - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

fn parse_v1(line: &[u8]) -> Result<Header> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::protocol("proxy v1 header is not ASCII"))?;
    let fields: Vec<&str> = line.split(' ').collect();

    match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => Ok(Header::Local),
        ["PROXY", proto @ ("TCP4" | "TCP6"), src, _dst, sport, _dport] => {
            let ip: IpAddr = src
                .parse()
                .map_err(|_| Error::protocol("bad source address in proxy v1 header"))?;
            match (*proto, ip) {
                ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => {}
                _ => return Err(Error::protocol("proxy v1 address family mismatch")),
            }
            let port: u16 = sport
                .parse()
                .map_err(|_| Error::protocol("bad source port in proxy v1 header"))?;
            Ok(Header::Proxied(SocketAddr::new(ip, port)))
        }
        _ => Err(Error::protocol("malformed proxy v1 header")),
    }
}

fn parse_v2(buf: &[u8]) -> Result<Header> {
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(Error::protocol("unacceptable proxy protocol version"));
    }
    let command = ver_cmd & 0x0f;
    let family = buf[13] >> 4;
    let addr = &buf[16..];

    if command == 0x0 {
        // LOCAL: health checks and the like keep the raw address
        return Ok(Header::Local);
    }
    if command != 0x1 {
        return Err(Error::protocol("unknown proxy v2 command"));
    }

    match family {
        0x1 => {
            if addr.len() < 12 {
                return Err(Error::protocol("short proxy v2 inet addresses"));
            }
            let src = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[8], addr[9]]);
            Ok(Header::Proxied(SocketAddr::new(IpAddr::V4(src), port)))
        }
        0x2 => {
            if addr.len() < 36 {
                return Err(Error::protocol("short proxy v2 inet6 addresses"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[..16]);
            let port = u16::from_be_bytes([addr[32], addr[33]]);
            Ok(Header::Proxied(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        0x0 => Ok(Header::Local),
        _ => Err(Error::protocol("unknown proxy v2 address family")),
    }
}
