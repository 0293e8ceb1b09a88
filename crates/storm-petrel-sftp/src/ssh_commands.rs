//! SSH exec command router
//!
//! Dispatches whitelisted non-SFTP commands. Hash sums are computed through
//! the filesystem facade so they honor the same sandbox and permissions as
//! SFTP transfers; `cd`/`pwd` exist because some mobile clients use them to
//! probe the initial directory instead of SSH_FXP_REALPATH. Every accepted
//! command finishes with an exit-status reply on its channel.

use crate::connection::ActivityTracker;
use crate::error::{Error, Result};
use crate::fs::{FsReader as _, VirtualFs};
use crate::scp::ScpCommand;
use async_trait::async_trait;
use sha2::digest::DynDigest;
use sha2::Digest;
use std::sync::Arc;
use storm_petrel_core::{Permission, User};
use tracing::{debug, warn};

/// Every SSH command this server can serve.
pub const SUPPORTED_COMMANDS: &[&str] = &[
    "scp", "md5sum", "sha1sum", "sha256sum", "sha384sum", "sha512sum", "cd", "pwd",
];

/// Commands enabled when the configuration does not say otherwise.
pub const DEFAULT_COMMANDS: &[&str] = &["md5sum", "sha1sum", "cd", "pwd"];

/// Expand the configured enabled-commands set: `*` turns on everything,
/// unsupported names are dropped with a warning.
pub fn expand_enabled(configured: &[String]) -> Vec<String> {
    if configured.iter().any(|c| c == "*") {
        return SUPPORTED_COMMANDS.iter().map(|s| s.to_string()).collect();
    }

    let mut enabled = Vec::new();
    for command in configured {
        if SUPPORTED_COMMANDS.contains(&command.as_str()) {
            enabled.push(command.clone());
        } else {
            warn!("unsupported ssh command {:?} ignored", command);
        }
    }
    enabled
}

/// Channel-side of a running exec command. The server backs this with the
/// SSH channel; tests back it with byte buffers.
#[async_trait]
pub trait ExecChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;
    /// Next chunk of stdin from the client; `None` at EOF.
    async fn recv(&mut self) -> Option<Vec<u8>>;
    /// Send the exit-status reply and close the channel.
    async fn exit(&mut self, status: u32);
}

/// A parsed, enabled command ready to run on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SshCommand {
    Hash { algo: HashAlgo, path: String },
    Cd,
    Pwd,
    Scp(ScpCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgo {
    fn from_program(program: &str) -> Option<Self> {
        Some(match program {
            "md5sum" => HashAlgo::Md5,
            "sha1sum" => HashAlgo::Sha1,
            "sha256sum" => HashAlgo::Sha256,
            "sha384sum" => HashAlgo::Sha384,
            "sha512sum" => HashAlgo::Sha512,
            _ => return None,
        })
    }

    fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgo::Md5 => Box::new(md5::Md5::new()),
            HashAlgo::Sha1 => Box::new(sha1::Sha1::new()),
            HashAlgo::Sha256 => Box::new(sha2::Sha256::new()),
            HashAlgo::Sha384 => Box::new(sha2::Sha384::new()),
            HashAlgo::Sha512 => Box::new(sha2::Sha512::new()),
        }
    }
}

/// Parse an exec request line into a command, honoring the enabled set.
/// `None` means the exec request gets a failure reply and no task.
pub fn parse(line: &str, enabled: &[String]) -> Option<SshCommand> {
    let tokens = tokenize(line)?;
    let (program, args) = tokens.split_first()?;

    if !enabled.iter().any(|e| e == program) {
        debug!("ssh command {:?} is not enabled", program);
        return None;
    }

    if let Some(algo) = HashAlgo::from_program(program) {
        let path = args.first()?.clone();
        return Some(SshCommand::Hash { algo, path });
    }

    match program.as_str() {
        "cd" => Some(SshCommand::Cd),
        "pwd" => Some(SshCommand::Pwd),
        "scp" => ScpCommand::parse(args).map(SshCommand::Scp),
        _ => None,
    }
}

/// Shell-style tokenizer for exec request lines: whitespace separated with
/// single/double quoting, no escapes. Unbalanced quotes fail the parse.
fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending || !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return None;
    }
    if pending || !current.is_empty() {
        tokens.push(current);
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Run a command to completion on its channel; always ends with an exit
/// status.
pub async fn run(
    command: SshCommand,
    fs: Arc<dyn VirtualFs>,
    user: User,
    activity: ActivityTracker,
    channel: &mut dyn ExecChannel,
) {
    activity.touch();
    let status = match command {
        SshCommand::Cd => 0,
        SshCommand::Pwd => match channel.send(b"/\n").await {
            Ok(()) => 0,
            Err(_) => 1,
        },
        SshCommand::Hash { algo, path } => {
            match hash_file(algo, &fs, &user, &path).await {
                Ok(digest) => {
                    let line = format!("{}  {}\n", digest, path);
                    match channel.send(line.as_bytes()).await {
                        Ok(()) => 0,
                        Err(_) => 1,
                    }
                }
                Err(err) => {
                    let message = format!("{}\n", err.client_message());
                    let _ = channel.send(message.as_bytes()).await;
                    1
                }
            }
        }
        SshCommand::Scp(scp) => crate::scp::run(scp, fs, user, activity.clone(), channel).await,
    };
    activity.touch();
    channel.exit(status).await;
}

/// Stream a file through the facade into the requested digest.
async fn hash_file(
    algo: HashAlgo,
    fs: &Arc<dyn VirtualFs>,
    user: &User,
    path: &str,
) -> Result<String> {
    if !user.has_permission(Permission::Download, path) {
        return Err(Error::permission_denied(path));
    }

    let mut reader = fs.open_read(path).await?;
    let mut hasher = algo.hasher();
    let mut offset = 0u64;
    loop {
        let chunk = reader.read_at(offset, 64 * 1024).await?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
        offset += chunk.len() as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}
