//! Login metrics
//!
//! Thread-safe counters for authentication activity, one set per login
//! method. The auth adapter emits exactly one attempt and one result per
//! login try, in that order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storm_petrel_core::LoginMethod;

#[derive(Debug, Default)]
struct MethodCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl MethodCounters {
    fn snapshot(&self) -> MethodSnapshot {
        MethodSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide login metrics.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    password: MethodCounters,
    public_key: MethodCounters,
    keyboard_interactive: MethodCounters,
    start_time: DateTime<Utc>,
}

/// Serializable snapshot of current counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub password: MethodSnapshot,
    pub public_key: MethodSnapshot,
    pub keyboard_interactive: MethodSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MethodSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                password: MethodCounters::default(),
                public_key: MethodCounters::default(),
                keyboard_interactive: MethodCounters::default(),
                start_time: Utc::now(),
            }),
        }
    }

    fn counters(&self, method: LoginMethod) -> &MethodCounters {
        match method {
            LoginMethod::Password => &self.inner.password,
            LoginMethod::PublicKey => &self.inner.public_key,
            LoginMethod::KeyboardInteractive => &self.inner.keyboard_interactive,
        }
    }

    /// Record that an authentication attempt for `method` started.
    pub fn add_login_attempt(&self, method: LoginMethod) {
        self.counters(method).attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of an authentication attempt.
    pub fn add_login_result(&self, method: LoginMethod, success: bool) {
        let counters = self.counters(method);
        if success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now
                .signed_duration_since(self.inner.start_time)
                .num_seconds(),
            password: self.inner.password.snapshot(),
            public_key: self.inner.public_key.snapshot(),
            keyboard_interactive: self.inner.keyboard_interactive.snapshot(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_and_result_counted_per_method() {
        let metrics = Metrics::new();

        metrics.add_login_attempt(LoginMethod::Password);
        metrics.add_login_result(LoginMethod::Password, true);
        metrics.add_login_attempt(LoginMethod::PublicKey);
        metrics.add_login_result(LoginMethod::PublicKey, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.password.attempts, 1);
        assert_eq!(snap.password.successes, 1);
        assert_eq!(snap.password.failures, 0);
        assert_eq!(snap.public_key.attempts, 1);
        assert_eq!(snap.public_key.failures, 1);
        assert_eq!(snap.keyboard_interactive.attempts, 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.add_login_attempt(LoginMethod::KeyboardInteractive);
        assert_eq!(metrics.snapshot().keyboard_interactive.attempts, 1);
    }

    #[test]
    fn test_json_export() {
        let metrics = Metrics::new();
        metrics.add_login_attempt(LoginMethod::Password);
        let json = metrics.to_json().unwrap();
        assert!(json.contains("\"attempts\": 1"));
    }
}
