//! Live connection registry and idle supervision
//!
//! NIST 800-53: AC-10 (Concurrent Session Control), AC-12 (Session Termination)
//! Implementation: a connection is registered exactly while its SFTP channel
//! is serving; removal is unconditional on driver exit, including error
//! paths. Per-user session counts are derived from the registry. A single
//! process-wide sweeper evicts connections idle past the configured timeout.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Monotonic activity stamp shared between the request router (writer) and
/// the idle sweeper (reader).
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last_activity_ms: Arc<AtomicI64>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        let tracker = Self {
            last_activity_ms: Arc::new(AtomicI64::new(0)),
        };
        tracker.touch();
        tracker
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let elapsed_ms = (Utc::now().timestamp_millis() - last).max(0);
        Duration::from_millis(elapsed_ms as u64)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered serving connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Opaque connection identifier (hex).
    pub id: String,
    pub username: String,
    pub remote_addr: SocketAddr,
    pub client_version: String,
    pub start_time: DateTime<Utc>,
    pub activity: ActivityTracker,
    /// Signalled by the sweeper to force the connection driver to drop the
    /// session.
    pub evict: Arc<Notify>,
}

/// Registry of connections whose SFTP channel is currently serving.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    sweeper_started: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, entry: ConnectionEntry) {
        let mut connections = self.connections.lock().await;
        let count = connections
            .values()
            .filter(|c| c.username == entry.username)
            .count();
        info!(
            "registered connection {} for user {:?} ({} active for user)",
            entry.id,
            entry.username,
            count + 1
        );
        connections.insert(entry.id.clone(), entry);
    }

    /// Remove a connection. Safe to call for ids that were never registered;
    /// teardown paths call this unconditionally.
    pub async fn unregister(&self, id: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(entry) = connections.remove(id) {
            debug!(
                "unregistered connection {} for user {:?}",
                entry.id, entry.username
            );
        }
    }

    /// Number of registered connections for a user.
    pub async fn active_sessions(&self, username: &str) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| c.username == username)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.connections.lock().await.contains_key(id)
    }

    /// Signal eviction for every connection idle longer than `timeout`.
    /// Entries stay registered until their drivers exit and unregister.
    pub async fn evict_idle(&self, timeout: Duration) -> usize {
        let connections = self.connections.lock().await;
        let mut evicted = 0;
        for entry in connections.values() {
            let idle = entry.activity.idle_for();
            if idle >= timeout {
                warn!(
                    "connection {} (user {:?}) idle for {:?}, closing",
                    entry.id, entry.username, idle
                );
                entry.evict.notify_waiters();
                evicted += 1;
            }
        }
        evicted
    }

    /// Start the process-wide idle sweeper. A second call is a no-op; the
    /// sweeper runs for the process lifetime.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        idle_timeout: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self
            .sweeper_started
            .swap(true, Ordering::SeqCst)
        {
            return None;
        }

        let registry = Arc::clone(self);
        // sweep cadence must not exceed half the timeout
        let interval = Duration::from_secs((idle_timeout.as_secs() / 2).max(1));
        info!(
            "idle sweeper running: timeout {:?}, cadence {:?}",
            idle_timeout, interval
        );

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.evict_idle(idle_timeout).await;
            }
        }))
    }
}

/// Mint an opaque hex connection id. The SSH layer does not expose its
/// session identifier, so ids come from a process-wide counter.
pub fn next_connection_id() -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let stamp = Utc::now().timestamp_millis() as u64;
    hex::encode((stamp ^ seq.rotate_left(32)).to_be_bytes()) + &hex::encode(seq.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, username: &str) -> ConnectionEntry {
        ConnectionEntry {
            id: id.to_string(),
            username: username.to_string(),
            remote_addr: "127.0.0.1:2022".parse().unwrap(),
            client_version: "SSH-2.0-test".to_string(),
            start_time: Utc::now(),
            activity: ActivityTracker::new(),
            evict: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let registry = ConnectionRegistry::new();
        registry.register(entry("a1", "alice")).await;
        registry.register(entry("a2", "alice")).await;
        registry.register(entry("b1", "bob")).await;

        assert_eq!(registry.active_sessions("alice").await, 2);
        assert_eq!(registry.active_sessions("bob").await, 1);
        assert_eq!(registry.len().await, 3);

        registry.unregister("a1").await;
        assert_eq!(registry.active_sessions("alice").await, 1);

        // unregistering twice is harmless
        registry.unregister("a1").await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_evict_idle_signals_stale_connections() {
        let registry = ConnectionRegistry::new();
        let stale = entry("old", "alice");
        stale
            .activity
            .last_activity_ms
            .store(Utc::now().timestamp_millis() - 120_000, Ordering::Relaxed);
        let evict = Arc::clone(&stale.evict);

        let fresh = entry("new", "bob");
        registry.register(stale).await;
        registry.register(fresh).await;

        let notified = tokio::spawn(async move { evict.notified().await });
        tokio::task::yield_now().await;

        let evicted = registry.evict_idle(Duration::from_secs(60)).await;
        assert_eq!(evicted, 1);
        notified.await.unwrap();

        // entries remain until the driver unregisters them
        assert!(registry.contains("old").await);
    }

    #[tokio::test]
    async fn test_sweeper_starts_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = registry.spawn_idle_sweeper(Duration::from_secs(60));
        let second = registry.spawn_idle_sweeper(Duration::from_secs(60));
        assert!(first.is_some());
        assert!(second.is_none());
        first.unwrap().abort();
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_activity_tracker_touch_resets_idle() {
        let tracker = ActivityTracker::new();
        tracker
            .last_activity_ms
            .store(Utc::now().timestamp_millis() - 5_000, Ordering::Relaxed);
        assert!(tracker.idle_for() >= Duration::from_secs(4));
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }
}
