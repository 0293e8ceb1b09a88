//! Authentication and authorization error types
//!
//! NIST 800-53: IA-2 (Identification and Authentication), SI-11 (Error Handling)
//! Implementation: authorization failures carry enough detail for the server
//! log while the SSH layer only ever reports a generic rejection to clients.

use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by identity providers and the login policy gate.
///
/// Every variant is surfaced to the client as a plain authentication failure;
/// the variant detail is for structured logs and metrics only.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Username unknown to the identity provider.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Supplied password or public key did not match.
    #[error("invalid credentials for user {0}")]
    InvalidCredentials(String),

    /// The user record carries a relative home directory; logins are refused
    /// because the chroot sandbox cannot be anchored.
    #[error("home directory {0:?} is not absolute")]
    RelativeHomeDir(PathBuf),

    /// The user already has `max_sessions` registered connections.
    #[error("too many open sessions: {0}")]
    TooManySessions(usize),

    /// Login method not in the user's allowed set.
    #[error("login method {0:?} is not allowed")]
    MethodNotAllowed(String),

    /// Remote address outside the user's allowed source networks.
    #[error("login not allowed from address {0}")]
    SourceNotAllowed(IpAddr),

    /// Keyboard-interactive requested but no valid helper program is
    /// configured.
    #[error("keyboard interactive authentication is not available")]
    KeyboardInteractiveUnavailable,

    /// Provider-side failure (backend unreachable, helper program error, ...).
    #[error("identity provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// True when the failure was a policy decision about a known user rather
    /// than a credential mismatch. Policy rejections are logged at a higher
    /// level because they usually indicate misconfiguration.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::RelativeHomeDir(_)
                | AuthError::TooManySessions(_)
                | AuthError::MethodNotAllowed(_)
                | AuthError::SourceNotAllowed(_)
        )
    }
}
