//! Auth adapter
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful
//! Logon Attempts)
//! Implementation: translates each SSH authentication attempt into identity
//! provider calls and applies the login policy gate. Exactly one attempt
//! metric and one result metric are emitted per try, in that order; failed
//! attempts produce a structured connection-failed log with the remote IP.

use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::error::Result;
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use storm_petrel_core::{AuthError, IdentityProvider, LoginMethod, User};
use tracing::{debug, info, warn};

/// A successful login: the user record and the recorded login-method string
/// (extended with the key fingerprint for public-key logins).
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub user: User,
    pub login_method: String,
}

pub struct AuthAdapter {
    provider: Arc<dyn IdentityProvider>,
    registry: Arc<ConnectionRegistry>,
    metrics: Metrics,
    keyboard_interactive_helper: Option<PathBuf>,
}

impl AuthAdapter {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        registry: Arc<ConnectionRegistry>,
        metrics: Metrics,
        keyboard_interactive_helper: Option<PathBuf>,
    ) -> Self {
        Self {
            provider,
            registry,
            metrics,
            keyboard_interactive_helper,
        }
    }

    pub fn keyboard_interactive_enabled(&self) -> bool {
        self.keyboard_interactive_helper.is_some()
    }

    pub async fn validate_password(
        &self,
        username: &str,
        password: &str,
        remote: SocketAddr,
    ) -> std::result::Result<AuthOutcome, AuthError> {
        let method = LoginMethod::Password;
        self.metrics.add_login_attempt(method);

        let result = match self.provider.check_user_and_pass(username, password).await {
            Ok(user) => self.login_user(user, method, remote, None).await,
            Err(err) => Err(err),
        };
        self.record(method, username, remote, &result);
        result
    }

    /// `key_blob` is the wire-marshalled public key offered by the client.
    pub async fn validate_public_key(
        &self,
        username: &str,
        key_blob: &[u8],
        remote: SocketAddr,
    ) -> std::result::Result<AuthOutcome, AuthError> {
        let method = LoginMethod::PublicKey;
        self.metrics.add_login_attempt(method);

        let result = match self
            .provider
            .check_user_and_pub_key(username, key_blob)
            .await
        {
            Ok((user, fingerprint)) => {
                self.login_user(user, method, remote, Some(&fingerprint)).await
            }
            Err(err) => Err(err),
        };
        self.record(method, username, remote, &result);
        result
    }

    pub async fn validate_keyboard_interactive(
        &self,
        username: &str,
        answers: &[String],
        remote: SocketAddr,
    ) -> std::result::Result<AuthOutcome, AuthError> {
        let method = LoginMethod::KeyboardInteractive;
        self.metrics.add_login_attempt(method);

        let result = match &self.keyboard_interactive_helper {
            None => Err(AuthError::KeyboardInteractiveUnavailable),
            Some(helper) => {
                match self
                    .provider
                    .check_keyboard_interactive(username, helper, answers)
                    .await
                {
                    Ok(user) => self.login_user(user, method, remote, None).await,
                    Err(err) => Err(err),
                }
            }
        };
        self.record(method, username, remote, &result);
        result
    }

    /// The login policy gate, applied after the provider accepted the
    /// credentials.
    async fn login_user(
        &self,
        user: User,
        method: LoginMethod,
        remote: SocketAddr,
        fingerprint: Option<&str>,
    ) -> std::result::Result<AuthOutcome, AuthError> {
        if !user.home_dir.is_absolute() {
            warn!(
                user = %user.username,
                home_dir = ?user.home_dir,
                "login refused: home directory must be an absolute path"
            );
            return Err(AuthError::RelativeHomeDir(user.home_dir.clone()));
        }

        if user.max_sessions > 0 {
            let active = self.registry.active_sessions(&user.username).await;
            if active >= user.max_sessions {
                debug!(
                    user = %user.username,
                    active,
                    max = user.max_sessions,
                    "login refused: too many open sessions"
                );
                return Err(AuthError::TooManySessions(active));
            }
        }

        if !user.is_login_method_allowed(method) {
            debug!(user = %user.username, %method, "login refused: method not allowed");
            return Err(AuthError::MethodNotAllowed(method.as_str().to_string()));
        }

        if !user.is_login_from_addr_allowed(remote.ip()) {
            debug!(user = %user.username, addr = %remote.ip(), "login refused: address not allowed");
            return Err(AuthError::SourceNotAllowed(remote.ip()));
        }

        let login_method = match fingerprint {
            Some(fp) => format!("{}: {}", method, fp),
            None => method.to_string(),
        };

        self.provider.update_last_login(&user).await;
        Ok(AuthOutcome { user, login_method })
    }

    fn record(
        &self,
        method: LoginMethod,
        username: &str,
        remote: SocketAddr,
        result: &std::result::Result<AuthOutcome, AuthError>,
    ) {
        self.metrics.add_login_result(method, result.is_ok());
        match result {
            Ok(outcome) => info!(
                user = %username,
                method = %outcome.login_method,
                addr = %remote.ip(),
                "login succeeded"
            ),
            Err(err) => warn!(
                user = %username,
                %method,
                addr = %remote.ip(),
                error = %err,
                "connection failed"
            ),
        }
    }
}

/// Validate the configured keyboard-interactive helper at startup. A
/// missing, relative or non-existent program disables the method with a
/// warning instead of failing startup.
pub fn validate_helper_program(config: &Config) -> Option<PathBuf> {
    let program = config.keyboard_interactive_program.as_ref()?;
    if !program.is_absolute() {
        warn!(
            "keyboard interactive program {:?} must be an absolute path; method disabled",
            program
        );
        return None;
    }
    if !program.exists() {
        warn!(
            "keyboard interactive program {:?} does not exist; method disabled",
            program
        );
        return None;
    }
    Some(program.clone())
}

/// Re-exported for the server's handshake setup.
pub fn read_login_banner(config: &Config, config_dir: &std::path::Path) -> Result<Option<String>> {
    let Some(banner_file) = &config.login_banner_file else {
        return Ok(None);
    };
    let path = if banner_file.is_absolute() {
        banner_file.clone()
    } else {
        config_dir.join(banner_file)
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) => {
            // an unreadable banner downgrades the feature, it is not fatal
            warn!("unable to read login banner file {:?}: {}", path, err);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ActivityTracker, ConnectionEntry};
    use chrono::Utc;
    use storm_petrel_core::StaticProvider;
    use tokio::sync::Notify;

    fn remote() -> SocketAddr {
        "198.51.100.7:40022".parse().unwrap()
    }

    fn adapter_with(provider: StaticProvider) -> (AuthAdapter, Arc<ConnectionRegistry>, Metrics) {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Metrics::new();
        let adapter = AuthAdapter::new(
            Arc::new(provider),
            Arc::clone(&registry),
            metrics.clone(),
            None,
        );
        (adapter, registry, metrics)
    }

    fn alice() -> User {
        User::with_full_access("alice", "/srv/data/alice")
    }

    async fn register(registry: &ConnectionRegistry, id: &str, username: &str) {
        registry
            .register(ConnectionEntry {
                id: id.to_string(),
                username: username.to_string(),
                remote_addr: remote(),
                client_version: "SSH-2.0-test".to_string(),
                start_time: Utc::now(),
                activity: ActivityTracker::new(),
                evict: Arc::new(Notify::new()),
            })
            .await;
    }

    #[tokio::test]
    async fn test_password_success_emits_paired_metrics() {
        let (adapter, _registry, metrics) =
            adapter_with(StaticProvider::new().with_password_user(alice(), "pw"));

        let outcome = adapter
            .validate_password("alice", "pw", remote())
            .await
            .unwrap();
        assert_eq!(outcome.user.username, "alice");
        assert_eq!(outcome.login_method, "password");

        let snap = metrics.snapshot();
        assert_eq!(snap.password.attempts, 1);
        assert_eq!(snap.password.successes, 1);
        assert_eq!(snap.password.failures, 0);
    }

    #[tokio::test]
    async fn test_bad_password_counts_failure() {
        let (adapter, _registry, metrics) =
            adapter_with(StaticProvider::new().with_password_user(alice(), "pw"));

        assert!(adapter
            .validate_password("alice", "nope", remote())
            .await
            .is_err());

        let snap = metrics.snapshot();
        assert_eq!(snap.password.attempts, 1);
        assert_eq!(snap.password.failures, 1);
    }

    #[tokio::test]
    async fn test_public_key_records_fingerprint() {
        let blob = vec![1u8, 2, 3];
        let (adapter, _registry, _metrics) = adapter_with(
            StaticProvider::new().with_key_user(alice(), blob.clone(), "SHA256:fp".into()),
        );

        let outcome = adapter
            .validate_public_key("alice", &blob, remote())
            .await
            .unwrap();
        assert_eq!(outcome.login_method, "publickey: SHA256:fp");
    }

    #[tokio::test]
    async fn test_relative_home_dir_is_refused() {
        let mut user = alice();
        user.home_dir = PathBuf::from("srv/data/alice");
        let (adapter, _registry, _metrics) =
            adapter_with(StaticProvider::new().with_password_user(user, "pw"));

        assert!(matches!(
            adapter.validate_password("alice", "pw", remote()).await,
            Err(AuthError::RelativeHomeDir(_))
        ));
    }

    #[tokio::test]
    async fn test_session_limit_is_enforced() {
        let mut user = alice();
        user.max_sessions = 2;
        let (adapter, registry, _metrics) =
            adapter_with(StaticProvider::new().with_password_user(user, "pw"));

        register(&registry, "c1", "alice").await;
        register(&registry, "c2", "alice").await;

        assert!(matches!(
            adapter.validate_password("alice", "pw", remote()).await,
            Err(AuthError::TooManySessions(2))
        ));

        registry.unregister("c1").await;
        assert!(adapter
            .validate_password("alice", "pw", remote())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_disallowed_method_is_refused() {
        let mut user = alice();
        user.allowed_login_methods = vec![LoginMethod::PublicKey];
        let (adapter, _registry, _metrics) =
            adapter_with(StaticProvider::new().with_password_user(user, "pw"));

        assert!(matches!(
            adapter.validate_password("alice", "pw", remote()).await,
            Err(AuthError::MethodNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_disallowed_source_is_refused() {
        let mut user = alice();
        user.allowed_sources = vec!["10.0.0.0/8".to_string()];
        let (adapter, _registry, _metrics) =
            adapter_with(StaticProvider::new().with_password_user(user, "pw"));

        assert!(matches!(
            adapter.validate_password("alice", "pw", remote()).await,
            Err(AuthError::SourceNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_keyboard_interactive_disabled_without_helper() {
        let (adapter, _registry, metrics) =
            adapter_with(StaticProvider::new().with_password_user(alice(), "pw"));

        assert!(matches!(
            adapter
                .validate_keyboard_interactive("alice", &["pw".to_string()], remote())
                .await,
            Err(AuthError::KeyboardInteractiveUnavailable)
        ));
        let snap = metrics.snapshot();
        assert_eq!(snap.keyboard_interactive.attempts, 1);
        assert_eq!(snap.keyboard_interactive.failures, 1);
    }

    #[test]
    fn test_helper_program_validation() {
        let mut config = Config::default();
        assert!(validate_helper_program(&config).is_none());

        config.keyboard_interactive_program = Some(PathBuf::from("relative/helper"));
        assert!(validate_helper_program(&config).is_none());

        config.keyboard_interactive_program = Some(PathBuf::from("/nonexistent/helper"));
        assert!(validate_helper_program(&config).is_none());

        let file = tempfile::NamedTempFile::new().unwrap();
        config.keyboard_interactive_program = Some(file.path().to_path_buf());
        assert_eq!(
            validate_helper_program(&config),
            Some(file.path().to_path_buf())
        );
    }

    #[test]
    fn test_login_banner_reading() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        assert_eq!(read_login_banner(&config, dir.path()).unwrap(), None);

        std::fs::write(dir.path().join("banner.txt"), "welcome\n").unwrap();
        config.login_banner_file = Some(PathBuf::from("banner.txt"));
        assert_eq!(
            read_login_banner(&config, dir.path()).unwrap(),
            Some("welcome\n".to_string())
        );

        config.login_banner_file = Some(PathBuf::from("missing.txt"));
        // unreadable banner downgrades instead of failing
        assert_eq!(read_login_banner(&config, dir.path()).unwrap(), None);
    }
}
