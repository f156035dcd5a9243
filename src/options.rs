//! Per-server configuration (spec.md §4.G), grounded on the teacher's
//! `FreeSwitchServer { host, port, password }` config shape
//! (`rust-billing-engine/src/config.rs`), extended with the event filter,
//! routing key, backoff bounds, and timeouts spec.md's `ServerOption` names.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::constants;

/// Remote ESL server identity and per-server tuning. `(host, port)` is the
/// only key that participates in equality/hashing, so a
/// `HashMap<(String, u16), ServerOption>` enforces spec.md's uniqueness
/// invariant directly: two `ServerOption`s for the same address are the
/// "same" entry even if other fields (password, filters) differ.
#[derive(Debug, Clone)]
pub struct ServerOption {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Opaque event-subscription expression forwarded verbatim to
    /// FreeSWITCH via `event plain <expr>` after auth (e.g. `ALL` or
    /// `CHANNEL_HANGUP CHANNEL_ANSWER`).
    pub event_filter: String,
    /// Caller-defined routing key for multiplexing several servers behind
    /// one dispatch table; not interpreted by this crate.
    pub routing_key: Option<String>,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ServerOption {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            event_filter: "ALL".to_string(),
            routing_key: None,
            reconnect_initial_delay: Duration::from_millis(constants::INITIAL_RECONNECT_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(constants::MAX_RECONNECT_DELAY_MS),
            command_timeout: Duration::from_secs(constants::DEFAULT_COMMAND_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(constants::DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn with_event_filter(mut self, expr: impl Into<String>) -> Self {
        self.event_filter = expr.into();
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn key(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the two options differ on fields that require tearing down
    /// and re-establishing an existing connection (spec.md §4.G: `addServer`
    /// replaces the record in place "without tearing down the connection
    /// unless authentication-relevant fields changed").
    pub fn requires_reconnect(&self, other: &ServerOption) -> bool {
        self.host != other.host || self.port != other.port || self.password != other.password
    }
}

impl PartialEq for ServerOption {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ServerOption {}

impl Hash for ServerOption {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

/// Thread-safe collection of `ServerOption`s keyed by `(host, port)`.
#[derive(Default)]
pub struct ServerOptions {
    entries: RwLock<HashMap<(String, u16), ServerOption>>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent add: replaces any existing record for the same
    /// `(host, port)`. Returns `true` if the replaced (or absent) entry
    /// requires the caller to reconnect the live `Connection`, if any.
    pub async fn add(&self, option: ServerOption) -> bool {
        let key = option.key();
        let mut entries = self.entries.write().await;
        let reconnect_required = match entries.get(&key) {
            Some(existing) => existing.requires_reconnect(&option),
            None => true,
        };
        entries.insert(key, option);
        reconnect_required
    }

    pub async fn remove(&self, host: &str, port: u16) -> Option<ServerOption> {
        self.entries.write().await.remove(&(host.to_string(), port))
    }

    pub async fn get(&self, host: &str, port: u16) -> Option<ServerOption> {
        self.entries.read().await.get(&(host.to_string(), port)).cloned()
    }

    /// Stable snapshot: a clone of the current entries, safe to iterate
    /// while concurrent `add`/`remove` calls proceed.
    pub async fn snapshot(&self) -> Vec<ServerOption> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_password() {
        let a = ServerOption::new("fs1.example.com", 8021, "ClueCon");
        let b = ServerOption::new("fs1.example.com", 8021, "different");
        assert_eq!(a, b);
    }

    #[test]
    fn test_requires_reconnect_on_password_change() {
        let a = ServerOption::new("fs1.example.com", 8021, "ClueCon");
        let b = ServerOption::new("fs1.example.com", 8021, "different");
        assert!(a.requires_reconnect(&b));
    }

    #[test]
    fn test_no_reconnect_when_identical() {
        let a = ServerOption::new("fs1.example.com", 8021, "ClueCon");
        let b = a.clone();
        assert!(!a.requires_reconnect(&b));
    }

    #[tokio::test]
    async fn test_add_replaces_in_place() {
        let options = ServerOptions::new();
        let needs_reconnect = options.add(ServerOption::new("fs1", 8021, "ClueCon")).await;
        assert!(needs_reconnect);

        let needs_reconnect = options
            .add(ServerOption::new("fs1", 8021, "ClueCon").with_event_filter("CHANNEL_ANSWER"))
            .await;
        assert!(!needs_reconnect);
        assert_eq!(options.len().await, 1);
        assert_eq!(options.get("fs1", 8021).await.unwrap().event_filter, "CHANNEL_ANSWER");
    }

    #[tokio::test]
    async fn test_remove() {
        let options = ServerOptions::new();
        options.add(ServerOption::new("fs1", 8021, "ClueCon")).await;
        let removed = options.remove("fs1", 8021).await;
        assert!(removed.is_some());
        assert!(options.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_is_stable() {
        let options = ServerOptions::new();
        options.add(ServerOption::new("fs1", 8021, "ClueCon")).await;
        options.add(ServerOption::new("fs2", 8021, "ClueCon")).await;
        let snapshot = options.snapshot().await;
        assert_eq!(snapshot.len(), 2);
    }
}
