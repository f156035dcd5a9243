//! Client facade: a pool of connections keyed by remote server, lifecycle
//! management, and the reconnect policy.
//!
//! One supervisor task per server loops `connect -> drive -> backoff ->
//! reconnect`, exposing connection-handle operations through the options
//! model and correlation registry rather than through per-service handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionHandle};
use crate::constants;
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::listener::{Listener, ParallelDispatcher};
use crate::options::{ServerOption, ServerOptions};

/// Exponential backoff with jitter (spec.md §4.F: base 1s, cap 60s, ±20%
/// jitter), modeled as a small stateful iterator rather than inlined sleep
/// math so the growth curve is unit-testable without a clock.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, attempt: 0 }
    }

    /// The delay for the next attempt, with jitter applied, advancing
    /// internal state. Doubles each call, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.initial.saturating_mul(1u32 << exponent.min(16));
        let capped = base.min(self.max);
        apply_jitter(capped)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let fraction = constants::RECONNECT_JITTER_FRACTION;
    let jitter: f64 = rand::thread_rng().gen_range(-fraction..=fraction);
    let millis = delay.as_millis() as f64 * (1.0 + jitter);
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Pool of inbound-mode connections keyed by `host:port`, one supervisor
/// task per configured server driving `connect -> run -> backoff ->
/// reconnect` (spec.md §4.F).
pub struct EslCluster {
    options: Arc<ServerOptions>,
    listener: Arc<dyn Listener>,
    parallel: Arc<ParallelDispatcher>,
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl EslCluster {
    pub fn new(listener: Arc<dyn Listener>) -> Self {
        Self {
            options: Arc::new(ServerOptions::new()),
            listener,
            parallel: Arc::new(ParallelDispatcher::default_sized()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Idempotent add: replaces any existing record for the same
    /// `(host, port)`; spawns (or respawns) the supervisor task only if the
    /// change touches an authentication-relevant field, per spec.md §4.F.
    pub async fn add_server(&self, option: ServerOption) {
        let key = option.remote_addr();
        let needs_reconnect = self.options.add(option.clone()).await;
        if !needs_reconnect && self.tasks.read().await.contains_key(&key) {
            return;
        }
        self.respawn(key, option).await;
    }

    async fn respawn(&self, key: String, option: ServerOption) {
        if let Some(old) = self.tasks.write().await.remove(&key) {
            old.abort();
        }
        self.connections.write().await.remove(&key);

        let options = self.options.clone();
        let listener = self.listener.clone();
        let parallel = self.parallel.clone();
        let connections = self.connections.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            supervise_server(task_key, option, options, listener, parallel, connections).await;
        });
        self.tasks.write().await.insert(key, handle);
    }

    /// Remove a configured server and tear down its connection (if any).
    pub async fn remove_server(&self, host: &str, port: u16) -> Option<ServerOption> {
        let key = format!("{}:{}", host, port);
        if let Some(task) = self.tasks.write().await.remove(&key) {
            task.abort();
        }
        self.connections.write().await.remove(&key);
        self.options.remove(host, port).await
    }

    pub async fn server_options(&self) -> Vec<ServerOption> {
        self.options.snapshot().await
    }

    async fn handle_for(&self, addr: &str) -> EslResult<ConnectionHandle> {
        self.connections
            .read()
            .await
            .get(addr)
            .cloned()
            .filter(ConnectionHandle::is_connected)
            .ok_or(EslError::NotConnected)
    }

    /// `api <cmd> <arg>`, awaiting the reply body.
    pub async fn send_sync_api_command(
        &self,
        addr: &str,
        api: &str,
        arg: Option<&str>,
        timeout: Option<Duration>,
    ) -> EslResult<String> {
        let handle = self.handle_for(addr).await?;
        handle.api(api, arg, timeout).await
    }

    /// Returns the `Job-UUID` synchronously; the `BACKGROUND_JOB` completion
    /// is delivered to the listener.
    pub async fn send_async_api_command(&self, addr: &str, api: &str, arg: Option<&str>) -> EslResult<String> {
        let handle = self.handle_for(addr).await?;
        handle.bgapi_fire_and_forget(api, arg, None).await
    }

    /// Returns a future that completes with the matching `BACKGROUND_JOB`
    /// event; that event is not additionally delivered to the listener.
    pub async fn send_background_api_command(&self, addr: &str, api: &str, arg: Option<&str>) -> EslResult<EslEvent> {
        let handle = self.handle_for(addr).await?;
        let (_uuid, rx) = handle.bgapi_tracked(api, arg, None).await?;
        rx.await.map_err(|_| EslError::ConnectionClosed)?
    }

    /// Orderly shutdown of one connection; does not remove its
    /// `ServerOption`, so the supervisor reconnects unless the caller also
    /// calls `remove_server`.
    pub async fn close(&self, addr: &str) -> EslResult<()> {
        let handle = self.handle_for(addr).await?;
        handle.exit(None).await
    }

    pub async fn close_all(&self) {
        let addrs: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for addr in addrs {
            if let Err(e) = self.close(&addr).await {
                warn!(addr = %addr, error = %e, "error closing connection during close_all");
            }
        }
    }
}

async fn supervise_server(
    key: String,
    option: ServerOption,
    options: Arc<ServerOptions>,
    listener: Arc<dyn Listener>,
    parallel: Arc<ParallelDispatcher>,
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
) {
    let mut backoff = Backoff::new(option.reconnect_initial_delay, option.reconnect_max_delay);

    loop {
        if options.get(&option.host, option.port).await.is_none() {
            break;
        }

        info!(server = %key, "connecting to FreeSWITCH ESL");
        let config = ConnectionConfig::from_server_option(&option);
        let stream = match tokio::net::TcpStream::connect((option.host.as_str(), option.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(server = %key, error = %e, "TCP connect failed");
                sleep_backoff(&mut backoff).await;
                continue;
            }
        };

        match Connection::run_inbound(stream, key.clone(), config, listener.clone(), parallel.clone()).await {
            Ok(handle) => {
                connections.write().await.insert(key.clone(), handle.clone());
                backoff.reset();
                // `run_inbound` spawns its own read-loop task and returns
                // immediately with a live handle; poll until the connection
                // drops so we know when to reconnect, without re-driving
                // any I/O ourselves (the spawned task owns that).
                while handle.is_connected() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                connections.write().await.remove(&key);
                info!(server = %key, "connection lost; will reconnect");
            }
            Err(e) => {
                warn!(server = %key, error = %e, "inbound handshake failed");
            }
        }

        if options.get(&option.host, option.port).await.is_none() {
            break;
        }
        sleep_backoff(&mut backoff).await;
    }
}

async fn sleep_backoff(backoff: &mut Backoff) {
    let delay = backoff.next_delay();
    tokio::time::sleep(delay).await;
}
