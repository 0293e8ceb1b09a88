//! Identity provider contract
//!
//! The connection engine never stores credentials itself; every
//! authentication attempt is translated into a call against this trait. A
//! small in-memory implementation is included so the server binary and the
//! test suites work without an external store.

use crate::error::AuthError;
use crate::user::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

/// External identity store consumed by the auth adapter.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a password login.
    async fn check_user_and_pass(&self, username: &str, password: &str)
        -> Result<User, AuthError>;

    /// Verify a public-key login. `key_blob` is the wire-marshalled public
    /// key as sent by the client; on success the user and the key
    /// fingerprint are returned.
    async fn check_user_and_pub_key(
        &self,
        username: &str,
        key_blob: &[u8],
    ) -> Result<(User, String), AuthError>;

    /// Verify a keyboard-interactive login. `helper` is the configured
    /// external challenge program; `answers` are the client's responses to
    /// the prompts in order.
    async fn check_keyboard_interactive(
        &self,
        username: &str,
        helper: &Path,
        answers: &[String],
    ) -> Result<User, AuthError>;

    /// Record a successful login. Failures here must not fail the login.
    async fn update_last_login(&self, user: &User);
}

/// Credentials held for one account by the in-memory provider.
#[derive(Debug, Clone)]
pub struct StaticAccount {
    pub user: User,
    pub password: Option<String>,
    /// (wire-marshalled key blob, fingerprint) pairs.
    pub authorized_keys: Vec<(Vec<u8>, String)>,
}

/// In-memory identity provider backed by a fixed account table.
///
/// Keyboard-interactive answers are checked against the account password;
/// the helper program path is accepted but not executed.
#[derive(Default)]
pub struct StaticProvider {
    accounts: HashMap<String, StaticAccount>,
    last_logins: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, account: StaticAccount) {
        self.accounts
            .insert(account.user.username.clone(), account);
    }

    pub fn with_password_user(mut self, user: User, password: impl Into<String>) -> Self {
        self.add_account(StaticAccount {
            user,
            password: Some(password.into()),
            authorized_keys: Vec::new(),
        });
        self
    }

    pub fn with_key_user(mut self, user: User, key_blob: Vec<u8>, fingerprint: String) -> Self {
        self.add_account(StaticAccount {
            user,
            password: None,
            authorized_keys: vec![(key_blob, fingerprint)],
        });
        self
    }

    /// Last recorded login time for a user, if any.
    pub async fn last_login(&self, username: &str) -> Option<DateTime<Utc>> {
        self.last_logins.lock().await.get(username).copied()
    }

    fn account(&self, username: &str) -> Result<&StaticAccount, AuthError> {
        self.accounts
            .get(username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    async fn check_user_and_pass(
        &self,
        username: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let account = self.account(username)?;
        match &account.password {
            Some(expected) if expected == password => Ok(account.user.clone()),
            _ => Err(AuthError::InvalidCredentials(username.to_string())),
        }
    }

    async fn check_user_and_pub_key(
        &self,
        username: &str,
        key_blob: &[u8],
    ) -> Result<(User, String), AuthError> {
        let account = self.account(username)?;
        for (blob, fingerprint) in &account.authorized_keys {
            if blob == key_blob {
                return Ok((account.user.clone(), fingerprint.clone()));
            }
        }
        Err(AuthError::InvalidCredentials(username.to_string()))
    }

    async fn check_keyboard_interactive(
        &self,
        username: &str,
        helper: &Path,
        answers: &[String],
    ) -> Result<User, AuthError> {
        debug!(
            "keyboard interactive check for {:?} via {:?}",
            username, helper
        );
        let account = self.account(username)?;
        match (&account.password, answers.first()) {
            (Some(expected), Some(answer)) if expected == answer => Ok(account.user.clone()),
            _ => Err(AuthError::InvalidCredentials(username.to_string())),
        }
    }

    async fn update_last_login(&self, user: &User) {
        self.last_logins
            .lock()
            .await
            .insert(user.username.clone(), Utc::now());
    }
}
