//! Internal SCP implementation
//!
//! SCP rides on SSH exec (`scp -t` sink for uploads, `scp -f` source for
//! downloads) and is implemented in-process rather than shelled out, so the
//! permission map, the key-prefix sandbox and the upload-mode policy apply
//! on every platform. Single files only; recursive transfers are refused.

use crate::connection::ActivityTracker;
use crate::error::{Error, Result};
use crate::fs::{FsReader as _, FsWriter as _, VirtualFs, WriteOptions};
use crate::ssh_commands::ExecChannel;
use std::collections::VecDeque;
use std::sync::Arc;
use storm_petrel_core::{Permission, User};
use tracing::{debug, warn};

const OK: u8 = 0x00;
const ERR: u8 = 0x01;
const FATAL: u8 = 0x02;

/// Transfer chunk size for source mode.
const CHUNK: u32 = 64 * 1024;

/// A parsed `scp` command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ScpCommand {
    /// `-t`: we are the sink, the client uploads.
    pub sink: bool,
    /// `-f`: we are the source, the client downloads.
    pub source: bool,
    /// `-r`: refused, directory trees are not supported.
    pub recursive: bool,
    pub path: String,
}

impl ScpCommand {
    pub fn parse(args: &[String]) -> Option<Self> {
        let mut command = ScpCommand {
            sink: false,
            source: false,
            recursive: false,
            path: String::new(),
        };

        let mut paths = Vec::new();
        for arg in args {
            match arg.as_str() {
                "-t" => command.sink = true,
                "-f" => command.source = true,
                "-r" => command.recursive = true,
                // accepted and ignored: times, directory mode, verbose
                "-p" | "-d" | "-v" => {}
                other if other.starts_with('-') => {
                    debug!("unknown scp option {:?} ignored", other);
                }
                other => paths.push(other.to_string()),
            }
        }

        if command.sink == command.source {
            return None;
        }
        command.path = paths.pop()?;
        Some(command)
    }
}

/// Drive an SCP transfer to completion; returns the exit status.
pub async fn run(
    command: ScpCommand,
    fs: Arc<dyn VirtualFs>,
    user: User,
    activity: ActivityTracker,
    channel: &mut dyn ExecChannel,
) -> u32 {
    if command.recursive {
        return fail(channel, "recursive transfers are not supported").await;
    }

    let mut stream = ScpStream::new(channel);
    let result = if command.sink {
        run_sink(&command, &fs, &user, &activity, &mut stream).await
    } else {
        run_source(&command, &fs, &user, &activity, &mut stream).await
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            warn!("scp transfer for {:?} failed: {}", command.path, err);
            fail(stream.channel, &err.client_message()).await
        }
    }
}

async fn fail(channel: &mut dyn ExecChannel, message: &str) -> u32 {
    let line = format!("scp: {}\n", message);
    let mut reply = vec![ERR];
    reply.extend_from_slice(line.as_bytes());
    let _ = channel.send(&reply).await;
    1
}

/// Receive one or more files from the client.
async fn run_sink(
    command: &ScpCommand,
    fs: &Arc<dyn VirtualFs>,
    user: &User,
    activity: &ActivityTracker,
    stream: &mut ScpStream<'_>,
) -> Result<()> {
    let target_is_dir = fs
        .stat(&command.path)
        .await
        .map(|info| info.is_dir())
        .unwrap_or(false);

    stream.send_ok().await?;

    loop {
        let Some(line) = stream.read_line().await? else {
            return Ok(()); // client is done
        };
        activity.touch();

        match line.first().copied() {
            Some(b'C') => {
                let (size, name) = parse_file_header(&line)?;
                let dest = if target_is_dir {
                    format!("{}/{}", command.path.trim_end_matches('/'), name)
                } else {
                    command.path.clone()
                };
                receive_file(fs, user, activity, stream, &dest, size).await?;
            }
            Some(b'T') => {
                // modification times: acknowledged, not applied
                stream.send_ok().await?;
            }
            Some(b'D') => {
                return Err(Error::unsupported("recursive transfers"));
            }
            Some(b'E') => {
                stream.send_ok().await?;
            }
            Some(ERR) | Some(FATAL) => {
                let message = String::from_utf8_lossy(&line[1..]).trim().to_string();
                return Err(Error::protocol(format!("remote scp error: {}", message)));
            }
            _ => {
                return Err(Error::protocol("unexpected scp control record"));
            }
        }
    }
}

async fn receive_file(
    fs: &Arc<dyn VirtualFs>,
    user: &User,
    activity: &ActivityTracker,
    stream: &mut ScpStream<'_>,
    dest: &str,
    size: u64,
) -> Result<()> {
    let required = if fs.stat(dest).await.is_ok() {
        Permission::Overwrite
    } else {
        Permission::Upload
    };
    if !user.has_permission(required, dest) {
        return Err(Error::permission_denied(dest));
    }

    let mut writer = fs
        .open_write(
            dest,
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await?;

    stream.send_ok().await?;

    let mut received = 0u64;
    while received < size {
        let want = ((size - received).min(CHUNK as u64)) as usize;
        let chunk = match stream.read_exact(want).await {
            Ok(chunk) => chunk,
            Err(err) => {
                writer.abort().await.ok();
                return Err(err);
            }
        };
        if let Err(err) = writer.write_at(received, &chunk).await {
            writer.abort().await.ok();
            return Err(err);
        }
        received += chunk.len() as u64;
        activity.touch();
    }

    // client terminates the data with an acknowledgement byte
    stream.read_ack().await?;
    writer.commit().await?;
    stream.send_ok().await
}

/// Send one file to the client.
async fn run_source(
    command: &ScpCommand,
    fs: &Arc<dyn VirtualFs>,
    user: &User,
    activity: &ActivityTracker,
    stream: &mut ScpStream<'_>,
) -> Result<()> {
    stream.read_ack().await?;

    let info = fs.stat(&command.path).await?;
    if info.is_dir() {
        return Err(Error::unsupported("downloading directories"));
    }
    if !user.has_permission(Permission::Download, &command.path) {
        return Err(Error::permission_denied(&command.path));
    }

    let header = format!("C0644 {} {}\n", info.size, info.name);
    stream.send(header.as_bytes()).await?;
    stream.read_ack().await?;

    let mut reader = fs.open_read(&command.path).await?;
    let mut offset = 0u64;
    while offset < info.size {
        let chunk = reader.read_at(offset, CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        stream.send(&chunk).await?;
        activity.touch();
    }

    stream.send_ok().await?;
    stream.read_ack().await
}

/// `C<mode> <size> <name>` control record.
fn parse_file_header(line: &[u8]) -> Result<(u64, String)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::protocol("scp file header is not UTF-8"))?;
    let mut fields = text.splitn(3, ' ');
    let _mode = fields
        .next()
        .filter(|m| m.len() == 5 && m.starts_with('C'))
        .ok_or_else(|| Error::protocol("bad scp file mode"))?;
    let size: u64 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol("bad scp file size"))?;
    let name = fields
        .next()
        .map(|n| n.trim_end_matches('\n').to_string())
        .filter(|n| !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| Error::protocol("bad scp file name"))?;
    Ok((size, name))
}

/// Byte-oriented view over the exec channel's message stream.
struct ScpStream<'a> {
    channel: &'a mut dyn ExecChannel,
    buffer: VecDeque<u8>,
    eof: bool,
}

impl<'a> ScpStream<'a> {
    fn new(channel: &'a mut dyn ExecChannel) -> Self {
        Self {
            channel,
            buffer: VecDeque::new(),
            eof: false,
        }
    }

    async fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.channel.recv().await {
            Some(chunk) => {
                self.buffer.extend(chunk);
                true
            }
            None => {
                self.eof = true;
                false
            }
        }
    }

    /// Read a full control line including the trailing newline; `None` on a
    /// clean EOF at a record boundary.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }
            if self.buffer.len() > 4096 {
                return Err(Error::protocol("scp control line too long"));
            }
            if !self.fill().await {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::protocol("truncated scp control line"));
            }
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < len {
            if !self.fill().await {
                return Err(Error::protocol("connection closed mid-transfer"));
            }
        }
        Ok(self.buffer.drain(..len).collect())
    }

    async fn read_ack(&mut self) -> Result<()> {
        let byte = self.read_exact(1).await?;
        match byte[0] {
            OK => Ok(()),
            code @ (ERR | FATAL) => {
                let message = self.read_line().await?.unwrap_or_default();
                Err(Error::protocol(format!(
                    "remote scp error ({}): {}",
                    code,
                    String::from_utf8_lossy(&message)
                )))
            }
            other => Err(Error::protocol(format!(
                "unexpected scp acknowledgement byte {}",
                other
            ))),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel.send(data).await
    }

    async fn send_ok(&mut self) -> Result<()> {
        self.channel.send(&[OK]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionHandler;
    use crate::fs::{FsSettings, LocalFs};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct MockChannel {
        sent: Vec<u8>,
        stdin: VecDeque<Vec<u8>>,
        exit_status: Option<u32>,
    }

    impl MockChannel {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                sent: Vec::new(),
                stdin: chunks.into(),
                exit_status: None,
            }
        }
    }

    #[async_trait]
    impl ExecChannel for MockChannel {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.extend_from_slice(data);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Vec<u8>> {
            self.stdin.pop_front()
        }

        async fn exit(&mut self, status: u32) {
            self.exit_status = Some(status);
        }
    }

    fn local_fs(dir: &TempDir) -> (Arc<dyn VirtualFs>, User) {
        let user = User::with_full_access("alice", dir.path());
        let fs: Arc<dyn VirtualFs> = Arc::new(LocalFs::new(
            user.clone(),
            "5c9".to_string(),
            FsSettings::default(),
            Arc::new(ActionHandler::default()),
        ));
        (fs, user)
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse() {
        let command = ScpCommand::parse(&strings(&["-t", "/up/dest"])).unwrap();
        assert!(command.sink && !command.source && !command.recursive);
        assert_eq!(command.path, "/up/dest");

        let command = ScpCommand::parse(&strings(&["-r", "-f", "/tree"])).unwrap();
        assert!(command.source && command.recursive);

        // exactly one direction is required
        assert!(ScpCommand::parse(&strings(&["-t", "-f", "/x"])).is_none());
        assert!(ScpCommand::parse(&strings(&["/x"])).is_none());
        assert!(ScpCommand::parse(&strings(&["-t"])).is_none());
    }

    #[test]
    fn test_parse_file_header() {
        let (size, name) = parse_file_header(b"C0644 1234 report.pdf").unwrap();
        assert_eq!(size, 1234);
        assert_eq!(name, "report.pdf");

        let (_, name) = parse_file_header(b"C0600 1 name with spaces").unwrap();
        assert_eq!(name, "name with spaces");

        assert!(parse_file_header(b"D0755 0 dir").is_err());
        assert!(parse_file_header(b"C0644 x f").is_err());
        assert!(parse_file_header(b"C0644 1 ../evil").is_err());
    }

    #[tokio::test]
    async fn test_sink_receives_file() {
        let dir = TempDir::new().unwrap();
        let (fs, user) = local_fs(&dir);

        let mut wire = b"C0644 11 hello.txt\n".to_vec();
        wire.extend_from_slice(b"hello world");
        wire.push(OK);
        let mut channel = MockChannel::new(vec![wire]);

        let command = ScpCommand::parse(&strings(&["-t", "/"])).unwrap();
        let status = run(command, fs, user, ActivityTracker::new(), &mut channel).await;

        assert_eq!(status, 0);
        assert_eq!(
            std::fs::read(dir.path().join("hello.txt")).unwrap(),
            b"hello world"
        );
        // server acks: ready, after header, after data
        assert_eq!(channel.sent, vec![OK, OK, OK]);
    }

    #[tokio::test]
    async fn test_sink_upload_to_explicit_path() {
        let dir = TempDir::new().unwrap();
        let (fs, user) = local_fs(&dir);

        let mut wire = b"T1700000000 0 1700000000 0\n".to_vec();
        wire.extend_from_slice(b"C0644 3 ignored-name\n");
        wire.extend_from_slice(b"abc");
        wire.push(OK);
        let mut channel = MockChannel::new(vec![wire]);

        let command = ScpCommand::parse(&strings(&["-p", "-t", "/dest.bin"])).unwrap();
        let status = run(command, fs, user, ActivityTracker::new(), &mut channel).await;

        assert_eq!(status, 0);
        assert_eq!(std::fs::read(dir.path().join("dest.bin")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_source_sends_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();
        let (fs, user) = local_fs(&dir);

        // client acks: ready, after header, after data
        let mut channel = MockChannel::new(vec![vec![OK], vec![OK], vec![OK]]);
        let command = ScpCommand::parse(&strings(&["-f", "/data.bin"])).unwrap();
        let status = run(command, fs, user, ActivityTracker::new(), &mut channel).await;

        assert_eq!(status, 0);
        let expected_header = b"C0644 10 data.bin\n";
        assert_eq!(&channel.sent[..expected_header.len()], expected_header);
        assert_eq!(
            &channel.sent[expected_header.len()..expected_header.len() + 10],
            b"0123456789"
        );
        assert_eq!(*channel.sent.last().unwrap(), OK);
    }

    #[tokio::test]
    async fn test_recursive_is_refused() {
        let dir = TempDir::new().unwrap();
        let (fs, user) = local_fs(&dir);
        let mut channel = MockChannel::new(vec![]);

        let command = ScpCommand::parse(&strings(&["-r", "-t", "/"])).unwrap();
        let status = run(command, fs, user, ActivityTracker::new(), &mut channel).await;

        assert_eq!(status, 1);
        assert_eq!(channel.sent[0], ERR);
    }

    #[tokio::test]
    async fn test_source_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let (fs, user) = local_fs(&dir);
        let mut channel = MockChannel::new(vec![vec![OK]]);

        let command = ScpCommand::parse(&strings(&["-f", "/absent"])).unwrap();
        let status = run(command, fs, user, ActivityTracker::new(), &mut channel).await;

        assert_eq!(status, 1);
        assert_eq!(channel.sent[0], ERR);
    }
}
