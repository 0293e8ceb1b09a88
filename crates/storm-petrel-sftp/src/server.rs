//! Listener, handshake engine and channel dispatcher
//!
//! The accept loop hands every socket to its own task: optional PROXY
//! unwrap, then the SSH handshake with a hard two-minute deadline, then
//! channel dispatch. Session channels carry either one SFTP subsystem
//! (request router) or exec commands; everything else is refused. The
//! connection driver owns teardown: aborting in-flight uploads and removing
//! the registry entry happen on every exit path.

use crate::actions::ActionHandler;
use crate::auth::{read_login_banner, validate_helper_program, AuthAdapter, AuthOutcome};
use crate::config::{Config, ProxyPolicy};
use crate::connection::{
    next_connection_id, ActivityTracker, ConnectionEntry, ConnectionRegistry,
};
use crate::error::{Error, Result};
use crate::fs::{self, FsSettings, ObjectStore, VirtualFs as _};
use crate::metrics::Metrics;
use crate::proxy;
use crate::security;
use crate::sftp::SftpEngine;
use crate::ssh_commands::{self, ExecChannel};
use crate::keys;
use async_trait::async_trait;
use chrono::Utc;
use russh::server::{run_stream, Auth, Config as SshConfig, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Preferred, SshId};
use russh_keys::key;
use russh_keys::PublicKeyBase64;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storm_petrel_core::{CidrBlock, IdentityProvider, User};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Handshake must complete within this window, matching OpenSSH's default
/// LoginGraceTime.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Immutable per-process state shared by every connection task.
pub struct ServerContext {
    pub config: Config,
    pub enabled_commands: Vec<String>,
    pub umask: u32,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Metrics,
    pub actions: Arc<ActionHandler>,
    pub auth: Arc<AuthAdapter>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub proxy_allow: Vec<CidrBlock>,
}

impl ServerContext {
    fn fs_settings(&self) -> FsSettings {
        FsSettings {
            upload_mode: self.config.upload_mode,
            setstat_mode: self.config.setstat_mode,
            umask: self.umask,
            part_size: self.config.object_part_size(),
        }
    }
}

/// The SFTP/SCP front end.
pub struct SftpServer {
    ctx: Arc<ServerContext>,
    ssh_config: Arc<SshConfig>,
}

impl SftpServer {
    /// Validate configuration, load key material and assemble the process
    /// context. Only listen-preventing problems are errors here; everything
    /// else downgrades with a warning.
    pub async fn new(
        config: Config,
        config_dir: &Path,
        provider: Arc<dyn IdentityProvider>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let host_keys = keys::load_host_keys(&config, config_dir).await?;
        let login_banner = read_login_banner(&config, config_dir)?;
        let helper = validate_helper_program(&config);

        let mut methods = MethodSet::PASSWORD | MethodSet::PUBLICKEY;
        if helper.is_some() {
            methods |= MethodSet::KEYBOARD_INTERACTIVE;
        }

        let ssh_config = SshConfig {
            server_id: SshId::Standard(format!("SSH-2.0-{}", config.banner)),
            methods,
            // configuration is immutable for the process lifetime, so the
            // one-time leak gives the handshake layer the 'static banner it
            // wants
            auth_banner: login_banner.map(|b| &*Box::leak(b.into_boxed_str())),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: host_keys,
            window_size: 2 * 1024 * 1024,
            maximum_packet_size: 32 * 1024,
            preferred: Preferred {
                kex: std::borrow::Cow::Borrowed(security::kex_preferences(&config.kex_algorithms)),
                cipher: std::borrow::Cow::Borrowed(security::cipher_preferences(&config.ciphers)),
                mac: std::borrow::Cow::Borrowed(security::mac_preferences(&config.macs)),
                ..Default::default()
            },
            ..Default::default()
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Metrics::new();
        let auth = Arc::new(AuthAdapter::new(
            provider,
            Arc::clone(&registry),
            metrics.clone(),
            helper,
        ));

        let ctx = ServerContext {
            enabled_commands: ssh_commands::expand_enabled(&config.enabled_ssh_commands),
            umask: config.parsed_umask(),
            proxy_allow: CidrBlock::parse_list(&config.proxy_allowed),
            registry,
            metrics,
            actions: Arc::new(ActionHandler::new(config.actions.clone())),
            auth,
            object_store,
            config,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            ssh_config: Arc::new(ssh_config),
        })
    }

    pub fn metrics(&self) -> Metrics {
        self.ctx.metrics.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Bind and serve forever. Per-connection failures never break the
    /// accept loop.
    pub async fn run(self) -> Result<()> {
        let addr = self.ctx.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("unable to listen on {}: {}", addr, e)))?;
        info!("server listener registered on {}", addr);

        if self.ctx.config.idle_timeout > 0 {
            let timeout = Duration::from_secs(self.ctx.config.idle_timeout * 60);
            self.ctx.registry.spawn_idle_sweeper(timeout);
        }

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("error accepting connection: {}", err);
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let ssh_config = Arc::clone(&self.ssh_config);
            tokio::spawn(async move {
                if let Err(err) = serve_connection(ctx, ssh_config, socket, peer).await {
                    debug!("connection from {} ended: {}", peer, err);
                }
            });
        }
    }
}

async fn serve_connection(
    ctx: Arc<ServerContext>,
    ssh_config: Arc<SshConfig>,
    socket: tokio::net::TcpStream,
    raw_peer: SocketAddr,
) -> Result<()> {
    socket.set_nodelay(true).ok();

    match ctx.config.proxy_protocol {
        ProxyPolicy::Off => drive_session(ctx, ssh_config, socket, raw_peer).await,
        policy => {
            let allow = ctx.proxy_allow.clone();
            let (stream, effective) = proxy::apply(socket, policy, &allow, raw_peer).await?;
            drive_session(ctx, ssh_config, stream, effective).await
        }
    }
}

/// Run one SSH session to completion, enforcing the handshake deadline and
/// idle eviction, and tearing down unconditionally afterwards.
async fn drive_session<S>(
    ctx: Arc<ServerContext>,
    ssh_config: Arc<SshConfig>,
    stream: S,
    remote_addr: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = next_connection_id();
    let activity = ActivityTracker::new();
    let evict = Arc::new(Notify::new());
    let authenticated = Arc::new(AtomicBool::new(false));
    let engine = Arc::new(Mutex::new(None));

    let handler = ConnectionHandler {
        ctx: Arc::clone(&ctx),
        connection_id: connection_id.clone(),
        remote_addr,
        activity: activity.clone(),
        evict: Arc::clone(&evict),
        authenticated: Arc::clone(&authenticated),
        engine: Arc::clone(&engine),
        auth_failures: 0,
        user: None,
        sftp_channel: None,
        exec: None,
    };

    let result = {
        let session = run_stream(ssh_config, stream, handler).await?;
        tokio::pin!(session);

        let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                outcome = &mut session => break outcome.map(|_| ()),
                _ = &mut deadline, if !authenticated.load(Ordering::SeqCst) => {
                    warn!(
                        "connection {} from {} dropped: {}",
                        connection_id,
                        remote_addr,
                        Error::HandshakeTimeout
                    );
                    break Err(Error::HandshakeTimeout);
                }
                _ = evict.notified() => {
                    break Err(Error::Connection("closed by idle supervisor".to_string()));
                }
            }
        }
    };

    // unconditional teardown: abort in-flight uploads and drop the registry
    // entry, whatever path got us here
    if let Some(mut engine) = engine.lock().await.take() {
        engine.shutdown().await;
    }
    ctx.registry.unregister(&connection_id).await;
    result
}

struct ExecState {
    channel: ChannelId,
    stdin: mpsc::Sender<Vec<u8>>,
}

struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    connection_id: String,
    remote_addr: SocketAddr,
    activity: ActivityTracker,
    evict: Arc<Notify>,
    authenticated: Arc<AtomicBool>,
    engine: Arc<Mutex<Option<SftpEngine>>>,
    auth_failures: u32,
    user: Option<AuthOutcome>,
    sftp_channel: Option<ChannelId>,
    exec: Option<ExecState>,
}

impl ConnectionHandler {
    fn accept(&mut self, outcome: AuthOutcome) -> Auth {
        self.authenticated.store(true, Ordering::SeqCst);
        self.user = Some(outcome);
        Auth::Accept
    }

    /// Reject the attempt, honoring the max-auth-tries budget: negative
    /// configuration means unlimited, zero means six, positive the exact
    /// count. Exhausting the budget terminates the connection.
    fn reject(&mut self) -> Result<Auth> {
        self.auth_failures += 1;
        if let Some(max) = self.ctx.config.effective_max_auth_tries() {
            if self.auth_failures >= max {
                warn!(
                    "connection {} from {} exceeded {} authentication attempts",
                    self.connection_id, self.remote_addr, max
                );
                return Err(Error::TooManyAuthAttempts);
            }
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// The authenticated user, or the zero-valued fallback if a channel is
    /// somehow served without one. The fallback can do nothing, but it must
    /// not panic the connection task.
    fn current_user(&self) -> AuthOutcome {
        match &self.user {
            Some(outcome) => outcome.clone(),
            None => {
                warn!(
                    "connection {}: channel served without an authenticated user",
                    self.connection_id
                );
                AuthOutcome {
                    user: User::default(),
                    login_method: "none".to_string(),
                }
            }
        }
    }

    async fn build_filesystem(&self, user: &User) -> Result<Arc<dyn fs::VirtualFs>> {
        let handle = fs::build_filesystem(
            user,
            &self.connection_id,
            self.ctx.fs_settings(),
            self.ctx.object_store.clone(),
            Arc::clone(&self.ctx.actions),
        )?;
        handle.check_root().await?;
        Ok(handle)
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        match self
            .ctx
            .auth
            .validate_password(user, password, self.remote_addr)
            .await
        {
            Ok(outcome) => Ok(self.accept(outcome)),
            Err(_) => self.reject(),
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &key::PublicKey) -> Result<Auth> {
        let key_blob = public_key.public_key_bytes();
        match self
            .ctx
            .auth
            .validate_public_key(user, &key_blob, self.remote_addr)
            .await
        {
            Ok(outcome) => Ok(self.accept(outcome)),
            Err(_) => self.reject(),
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'async_trait>>,
    ) -> Result<Auth> {
        if !self.ctx.auth.keyboard_interactive_enabled() {
            return self.reject();
        }

        match response {
            None => Ok(Auth::Partial {
                name: "".into(),
                instructions: "".into(),
                prompts: vec![("Password: ".into(), false)].into(),
            }),
            Some(response) => {
                let answers: Vec<String> = response
                    .into_iter()
                    .map(|answer| String::from_utf8_lossy(&answer).into_owned())
                    .collect();
                match self
                    .ctx
                    .auth
                    .validate_keyboard_interactive(user, &answers, self.remote_addr)
                    .await
                {
                    Ok(outcome) => Ok(self.accept(outcome)),
                    Err(_) => self.reject(),
                }
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(
            "connection {}: session channel {} opened",
            self.connection_id,
            channel.id()
        );
        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!("rejecting x11 channel {}", channel.id());
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!("rejecting direct-tcpip channel {}", channel.id());
        Ok(false)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            debug!("refusing subsystem {:?}", name);
            session.channel_failure(channel_id);
            return Ok(());
        }
        if self.sftp_channel.is_some() {
            warn!(
                "connection {}: refusing second sftp subsystem bind",
                self.connection_id
            );
            session.channel_failure(channel_id);
            return Ok(());
        }

        let outcome = self.current_user();
        let handle = match self.build_filesystem(&outcome.user).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    "could not create filesystem for user {:?}: {}",
                    outcome.user.username, err
                );
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        self.ctx
            .registry
            .register(ConnectionEntry {
                id: self.connection_id.clone(),
                username: outcome.user.username.clone(),
                remote_addr: self.remote_addr,
                client_version: "unknown".to_string(),
                start_time: Utc::now(),
                activity: self.activity.clone(),
                evict: Arc::clone(&self.evict),
            })
            .await;

        info!(
            "user id {}, logged in with {:?}, username {:?}, home {:?}, remote {}, connection {}",
            outcome.user.id,
            outcome.login_method,
            outcome.user.username,
            outcome.user.home_dir,
            self.remote_addr,
            self.connection_id
        );

        *self.engine.lock().await = Some(SftpEngine::new(
            handle,
            outcome.user,
            self.activity.clone(),
        ));
        self.sftp_channel = Some(channel_id);
        session.channel_success(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        // a channel already bound to SFTP does not take exec requests:
        // first successful bind wins
        if self.sftp_channel == Some(channel_id) || self.exec.is_some() {
            session.channel_failure(channel_id);
            return Ok(());
        }

        let line = String::from_utf8_lossy(data).to_string();
        let Some(command) = ssh_commands::parse(&line, &self.ctx.enabled_commands) else {
            debug!("refusing ssh command {:?}", line);
            session.channel_failure(channel_id);
            return Ok(());
        };

        let outcome = self.current_user();
        let handle = match self.build_filesystem(&outcome.user).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    "could not create filesystem for user {:?}: {}",
                    outcome.user.username, err
                );
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        debug!(
            "connection {}: running ssh command {:?}",
            self.connection_id, line
        );
        let (stdin_tx, stdin_rx) = mpsc::channel(32);
        self.exec = Some(ExecState {
            channel: channel_id,
            stdin: stdin_tx,
        });
        session.channel_success(channel_id);

        let mut io = SshExecChannel {
            handle: session.handle(),
            channel: channel_id,
            stdin: stdin_rx,
        };
        let user = outcome.user;
        let activity = self.activity.clone();
        tokio::spawn(async move {
            ssh_commands::run(command, handle, user, activity, &mut io).await;
        });
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<()> {
        if self.sftp_channel == Some(channel) {
            let mut guard = self.engine.lock().await;
            if let Some(engine) = guard.as_mut() {
                match engine.input(data).await {
                    Ok(responses) => {
                        for frame in responses {
                            session.data(channel, CryptoVec::from_slice(&frame));
                        }
                    }
                    Err(err) => {
                        warn!(
                            "connection {}: sftp protocol error: {}",
                            self.connection_id, err
                        );
                        return Err(err);
                    }
                }
            }
            return Ok(());
        }

        if let Some(exec) = &self.exec {
            if exec.channel == channel {
                self.activity.touch();
                let _ = exec.stdin.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        if self.sftp_channel == Some(channel) {
            debug!(
                "connection {}: channel closed by client, sending exit status",
                self.connection_id
            );
            if let Some(engine) = self.engine.lock().await.as_mut() {
                engine.shutdown().await;
            }
            session.exit_status_request(channel, 0);
            session.eof(channel);
            session.close(channel);
            return Ok(());
        }

        if let Some(exec) = &self.exec {
            if exec.channel == channel {
                // dropping the sender delivers stdin EOF to the command task
                self.exec = None;
            }
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if self.sftp_channel == Some(channel) {
            if let Some(mut engine) = self.engine.lock().await.take() {
                engine.shutdown().await;
            }
            self.sftp_channel = None;
            // registered if and only if serving
            self.ctx.registry.unregister(&self.connection_id).await;
        }
        if let Some(exec) = &self.exec {
            if exec.channel == channel {
                self.exec = None;
            }
        }
        Ok(())
    }
}

/// Exec command I/O backed by the SSH channel.
struct SshExecChannel {
    handle: russh::server::Handle,
    channel: ChannelId,
    stdin: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| Error::Connection("channel closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.stdin.recv().await
    }

    async fn exit(&mut self, status: u32) {
        let _ = self.handle.exit_status_request(self.channel, status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}
