//! # Storm Petrel SFTP
//!
//! Multi-tenant SFTP/SCP front end: SSH termination, authentication against
//! an external identity provider, per-connection channel dispatch, and an
//! SFTP request router bridging onto per-user virtual filesystems (local
//! disk or object storage) with a chroot-like key-prefix sandbox.
//!
//! The crate is organised around the connection pipeline:
//! socket → optional PROXY unwrap ([`proxy`]) → SSH handshake and channel
//! dispatch ([`server`]) → auth adapter ([`auth`]) → SFTP router ([`sftp`])
//! or SSH command router ([`ssh_commands`]) → filesystem facade ([`fs`]).

pub mod actions;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod fs;
pub mod keys;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod scp;
pub mod security;
pub mod server;
pub mod sftp;
pub mod ssh_commands;

pub use actions::{ActionEvent, ActionHandler, ActionsConfig};
pub use config::{Config, HostKey, ProxyPolicy, SetstatMode, UploadMode};
pub use connection::ConnectionRegistry;
pub use error::{Error, Result};
pub use fs::{MemoryObjectStore, ObjectStore, VirtualFs};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::SftpServer;
