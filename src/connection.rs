//! Connection handler (spec.md §4.C): owns one TCP session, drives the
//! `Connecting -> Authenticating -> Ready -> Draining -> Closed` state
//! machine, and dispatches inbound frames to the correlation registry or the
//! listener.
//!
//! Grounded on `rust-billing-engine/src/esl/connection.rs::EslConnection`
//! (byte-oriented read loop, auth handshake, event subscription) and
//! `.../esl/server.rs::EslServer::handle_connection` (outbound greeting),
//! generalized from ad hoc string matching onto the shared codec
//! (`codec.rs`) and a typed dispatch table.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::command::{CommandWriter, SendMsg};
use crate::constants;
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::listener::{Context, Listener, OrderedDispatcher, ParallelDispatcher};
use crate::message::{ContentType, EslMessage};
use crate::options::ServerOption;
use crate::registry::CorrelationRegistry;

/// Per-connection lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Authenticating => 1,
            ConnectionState::Ready => 2,
            ConnectionState::Draining => 3,
            ConnectionState::Closed => 4,
        }
    }
}

/// Which side initiated the TCP session; the two modes share the codec,
/// command writer and correlation registry and differ only in the connect
/// handshake (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// FreeSWITCH dials into us (the `socket` dialplan application).
    Outbound,
    /// We dial into FreeSWITCH and authenticate with a configured password.
    Inbound,
}

/// Shared state behind a cheap-to-clone `ConnectionHandle`. Writes are
/// serialized both by `CommandWriter`'s own mutex and by `send_lock`, which
/// additionally covers the registry enqueue so that FIFO order matches wire
/// order (spec.md §4.D's central invariant).
struct ConnectionShared {
    remote_addr: String,
    mode: ConnectionMode,
    state: AtomicU8,
    registry: CorrelationRegistry,
    writer: CommandWriter<OwnedWriteHalf>,
    send_lock: AsyncMutex<()>,
    default_timeout: Duration,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Enqueue a pending API reply slot and write `cmd` atomically under
    /// `send_lock`, then await the reply with `timeout` (or the connection's
    /// default). This is the single choke point every synchronous command
    /// (`auth`, `connect`, `event`, `api`, `bgapi`, the idle probe) goes
    /// through, which is what makes pendingApi's FIFO-matches-wire-order
    /// invariant hold under concurrent callers.
    async fn call(&self, cmd: &str, timeout: Option<Duration>) -> EslResult<EslMessage> {
        let rx = {
            let _guard = self.send_lock.lock().await;
            let rx = self.registry.enqueue_api().await;
            self.writer.write_line(cmd).await?;
            rx
        };
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without completing: connection tore down mid-call.
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            Err(_) => {
                // `rx` was dropped when the timeout future won the race,
                // closing its half of the oneshot; reclaim the now-dead slot
                // from `pendingApi` instead of waiting for the next reply (or
                // connection teardown) to discover it (spec.md §4.D).
                self.registry.prune_closed_api_slots().await;
                Err(EslError::Timeout)
            }
        }
    }
}

/// Cheap handle to a live (or no-longer-live) connection, passed to listener
/// callbacks via `Context` and held by `client.rs`'s facade. Cloning is
/// `Arc`-cheap; every method is a no-op `NotConnected` error once the
/// connection has torn down.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Option<Arc<ConnectionShared>>,
}

impl ConnectionHandle {
    fn live(shared: Arc<ConnectionShared>) -> Self {
        Self { inner: Some(shared) }
    }

    /// A handle bound to no connection; used by tests and by callers that
    /// need a `Context` before a real session exists.
    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .as_ref()
            .map(|s| s.state() == ConnectionState::Ready)
            .unwrap_or(false)
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.inner.as_ref().map(|s| s.remote_addr.as_str())
    }

    pub fn mode(&self) -> Option<ConnectionMode> {
        self.inner.as_ref().map(|s| s.mode)
    }

    fn shared(&self) -> EslResult<&Arc<ConnectionShared>> {
        self.inner.as_ref().ok_or(EslError::NotConnected)
    }

    /// `api <cmd> <arg>`, awaiting the synchronous reply body.
    pub async fn api(&self, cmd: &str, arg: Option<&str>, timeout: Option<Duration>) -> EslResult<String> {
        let shared = self.shared()?;
        let line = match arg {
            Some(arg) => format!("{} {} {}", constants::API_COMMAND, cmd, arg),
            None => format!("{} {}", constants::API_COMMAND, cmd),
        };
        let msg = shared.call(&line, timeout).await?;
        if msg.is_error() {
            return Err(EslError::CommandError {
                reply_text: msg.error_text().unwrap_or_default().to_string(),
            });
        }
        Ok(msg.body().unwrap_or_default().to_string())
    }

    /// `bgapi <cmd> <arg>`, returning the `Job-UUID` without registering a
    /// pending-job slot. The caller is expected to observe completion via
    /// the event listener (spec.md §4.F `sendAsyncApiCommand`).
    pub async fn bgapi_fire_and_forget(
        &self,
        cmd: &str,
        arg: Option<&str>,
        timeout: Option<Duration>,
    ) -> EslResult<String> {
        let shared = self.shared()?;
        bgapi_job_uuid(shared, cmd, arg, timeout).await
    }

    /// `bgapi <cmd> <arg>`, registering a pending-job slot keyed by the
    /// returned `Job-UUID` and returning a receiver that completes when the
    /// matching `BACKGROUND_JOB` event arrives. That event is then *not*
    /// delivered to the listener (spec.md §4.F `sendBackgroundApiCommand`).
    pub async fn bgapi_tracked(
        &self,
        cmd: &str,
        arg: Option<&str>,
        timeout: Option<Duration>,
    ) -> EslResult<(String, tokio::sync::oneshot::Receiver<EslResult<EslEvent>>)> {
        let shared = self.shared()?;
        let job_uuid = bgapi_job_uuid(shared, cmd, arg, timeout).await?;
        let rx = shared.registry.register_job(job_uuid.clone()).await?;
        Ok((job_uuid, rx))
    }

    /// Send one or more `sendmsg` batches (spec.md §4.B). Not correlated
    /// through `pendingApi` by this call; FreeSWITCH replies to `sendmsg`
    /// with an ordinary `command/reply` which the caller may separately
    /// await via `api`-style correlation if it chooses to track it — most
    /// callers fire sendmsg and observe the resulting `CHANNEL_EXECUTE*`
    /// events instead.
    pub async fn sendmsg(&self, msgs: &[SendMsg]) -> EslResult<()> {
        let shared = self.shared()?;
        shared.writer.write_sendmsg(msgs).await
    }

    /// Write `event plain <filter>` and await the reply.
    pub async fn subscribe_events(&self, filter: &str, timeout: Option<Duration>) -> EslResult<()> {
        let shared = self.shared()?;
        let line = format!("{} plain {}", constants::EVENT_COMMAND, filter);
        let msg = shared.call(&line, timeout).await?;
        if msg.is_error() {
            return Err(EslError::CommandError {
                reply_text: msg.error_text().unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    /// Write `exit` and await the reply; does not itself close the socket —
    /// the read loop observing EOF (or a disconnect notice) drives teardown.
    pub async fn exit(&self, timeout: Option<Duration>) -> EslResult<()> {
        let shared = self.shared()?;
        shared.call(constants::EXIT_COMMAND, timeout).await?;
        Ok(())
    }
}

async fn bgapi_job_uuid(
    shared: &Arc<ConnectionShared>,
    cmd: &str,
    arg: Option<&str>,
    timeout: Option<Duration>,
) -> EslResult<String> {
    let line = match arg {
        Some(arg) => format!("{} {} {}", constants::BGAPI_COMMAND, cmd, arg),
        None => format!("{} {}", constants::BGAPI_COMMAND, cmd),
    };
    let msg = shared.call(&line, timeout).await?;
    if msg.is_error() {
        return Err(EslError::CommandError {
            reply_text: msg.error_text().unwrap_or_default().to_string(),
        });
    }
    msg.header("Job-UUID").map(str::to_string).ok_or(EslError::MissingJobUuid)
}

/// Tuning knobs a `Connection` is driven with; distinct from `ServerOption`
/// so the outbound acceptor (which has no configured password/event filter)
/// can construct one without a full server record.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
    pub event_filter: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(constants::DEFAULT_COMMAND_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(constants::DEFAULT_IDLE_TIMEOUT_SECS),
            event_filter: None,
            password: None,
        }
    }
}

impl ConnectionConfig {
    pub fn from_server_option(option: &ServerOption) -> Self {
        Self {
            command_timeout: option.command_timeout,
            idle_timeout: option.idle_timeout,
            event_filter: Some(option.event_filter.clone()),
            password: Some(option.password.clone()),
        }
    }
}

/// Drives one TCP session end to end. `run_outbound`/`run_inbound` perform
/// the handshake and then the read loop; both return once the connection
/// has torn down (teardown is not an error by itself — callers inspect the
/// `Result` only to log the cause).
pub struct Connection;

impl Connection {
    /// Outbound mode: FreeSWITCH has just connected to us. Sends `connect`,
    /// awaits the promoted `EslEvent`, dispatches `on_connect`, then drives
    /// the read loop until teardown.
    pub async fn run_outbound(
        stream: TcpStream,
        remote_addr: String,
        config: ConnectionConfig,
        listener: Arc<dyn Listener>,
        parallel: Arc<ParallelDispatcher>,
    ) -> EslResult<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(constants::READ_BUFFER_SIZE, read_half);
        let shared = Arc::new(ConnectionShared {
            remote_addr: remote_addr.clone(),
            mode: ConnectionMode::Outbound,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            registry: CorrelationRegistry::new(),
            writer: CommandWriter::new(write_half),
            send_lock: AsyncMutex::new(()),
            default_timeout: config.command_timeout,
        });
        let handle = ConnectionHandle::live(shared.clone());
        let ctx = Context::new(handle.clone(), remote_addr.clone(), config.command_timeout);

        info!(remote_addr = %remote_addr, "outbound ESL session accepted");

        // `read_loop` (and the registry it drives) isn't running yet, so the
        // handshake reply is read directly off the same reader rather than
        // routed through `shared.call`'s oneshot — nothing would be polling
        // the socket to complete it otherwise.
        let connect_reply = match handshake_roundtrip(&shared, &mut reader, constants::CONNECT_COMMAND).await {
            Ok(msg) => msg,
            Err(e) => {
                error!(remote_addr = %remote_addr, error = %e, "outbound connect handshake failed");
                shared.registry.fail_all(|| EslError::ConnectionClosed).await;
                shared.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };
        shared.set_state(ConnectionState::Ready);
        let initial_event = EslEvent::promote(&connect_reply);
        parallel.spawn_on_connect(listener.clone(), ctx.clone(), initial_event);

        read_loop(shared, reader, ctx, listener, config.idle_timeout).await
    }

    /// Inbound mode: we have just dialed FreeSWITCH. Reads the `auth/request`
    /// greeting, sends `auth <password>`, subscribes to events, then drives
    /// the read loop until teardown.
    pub async fn run_inbound(
        stream: TcpStream,
        remote_addr: String,
        config: ConnectionConfig,
        listener: Arc<dyn Listener>,
        parallel: Arc<ParallelDispatcher>,
    ) -> EslResult<ConnectionHandle> {
        let (mut read_half, write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(constants::READ_BUFFER_SIZE, &mut read_half);

        let greeting = codec::read_message(&mut reader).await?;
        if *greeting.content_type() != ContentType::AuthRequest {
            return Err(EslError::AuthFailed("expected auth/request greeting".to_string()));
        }
        drop(reader);

        let shared = Arc::new(ConnectionShared {
            remote_addr: remote_addr.clone(),
            mode: ConnectionMode::Inbound,
            state: AtomicU8::new(ConnectionState::Authenticating.as_u8()),
            registry: CorrelationRegistry::new(),
            writer: CommandWriter::new(write_half),
            send_lock: AsyncMutex::new(()),
            default_timeout: config.command_timeout,
        });
        let handle = ConnectionHandle::live(shared.clone());
        let ctx = Context::new(handle.clone(), remote_addr.clone(), config.command_timeout);

        let mut reader = BufReader::with_capacity(constants::READ_BUFFER_SIZE, read_half);

        let password = config.password.clone().unwrap_or_default();
        let auth_line = format!("{} {}", constants::AUTH_COMMAND, password);
        // As in `run_outbound`, the handshake happens before `read_loop`
        // exists to service `shared.call`'s registry, so every round-trip
        // here reads the reply directly off `reader`.
        let auth_reply = handshake_roundtrip(&shared, &mut reader, &auth_line).await?;
        if !auth_reply.is_ok() {
            let reason = auth_reply.error_text().unwrap_or("authentication rejected").to_string();
            shared.set_state(ConnectionState::Closed);
            shared.registry.fail_all(|| EslError::ConnectionClosed).await;
            return Err(EslError::AuthFailed(reason));
        }
        // Fire-and-forget notification; the handshake itself does not
        // depend on the listener's observer hook completing.
        parallel.spawn_on_connect(NoopOnAuth::wrap(listener.clone()), ctx.clone(), EslEvent::promote(&auth_reply));

        if let Some(filter) = &config.event_filter {
            let line = format!("{} plain {}", constants::EVENT_COMMAND, filter);
            match handshake_roundtrip(&shared, &mut reader, &line).await {
                Ok(reply) if reply.is_error() => {
                    warn!(remote_addr = %remote_addr, reply = ?reply.error_text(), "event subscription rejected; continuing without it");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(remote_addr = %remote_addr, error = %e, "event subscription failed; continuing without it");
                }
            }
        }

        shared.set_state(ConnectionState::Ready);
        info!(remote_addr = %remote_addr, "inbound ESL session authenticated");

        let handle_for_run = handle.clone();
        let run_listener = listener;
        let idle_timeout = config.idle_timeout;
        tokio::spawn(async move {
            let _ = read_loop(shared, reader, ctx, run_listener, idle_timeout).await;
        });

        Ok(handle_for_run)
    }
}

/// Writes `cmd` and reads the single reply that follows, bypassing the
/// correlation registry entirely. Used only during the handshake, before
/// `read_loop` exists to service `ConnectionShared::call`'s oneshot.
async fn handshake_roundtrip(
    shared: &Arc<ConnectionShared>,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    cmd: &str,
) -> EslResult<EslMessage> {
    shared.writer.write_line(cmd).await?;
    codec::read_message(reader).await
}

/// `parallel.spawn_on_connect` expects an `on_connect`-shaped callback; we
/// reuse it to fire the inbound auth-request notification without blocking
/// the handshake on a full `Listener` invocation. Wraps the real listener so
/// `handle_auth_request` runs under the same bounded pool `on_connect` does.
struct NoopOnAuth {
    inner: Arc<dyn Listener>,
}

impl NoopOnAuth {
    fn wrap(inner: Arc<dyn Listener>) -> Arc<dyn Listener> {
        Arc::new(Self { inner })
    }
}

#[async_trait::async_trait]
impl Listener for NoopOnAuth {
    async fn on_connect(&self, ctx: Context, _event: EslEvent) {
        self.inner.handle_auth_request(ctx).await;
    }
}

async fn read_loop(
    shared: Arc<ConnectionShared>,
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    ctx: Context,
    listener: Arc<dyn Listener>,
    idle_timeout: Duration,
) -> EslResult<()> {
    let ordered = OrderedDispatcher::spawn(listener.clone());

    let teardown_cause = loop {
        match tokio::time::timeout(idle_timeout, codec::read_message(&mut reader)).await {
            Ok(Ok(message)) => {
                if let Err(e) = dispatch_message(&shared, message, &ctx, &ordered, &listener).await {
                    break e;
                }
            }
            Ok(Err(e)) => break e,
            Err(_elapsed) => {
                // Idle window expired: probe liveness with `bgapi status`,
                // fire-and-forget (spec.md §4.C). Registering the resulting
                // Job-UUID as a pending job (discarding the receiver) is
                // what keeps the probe's own `BACKGROUND_JOB` event from
                // ever reaching the listener — `complete_job` suppresses
                // delivery for any matched pending job regardless of origin
                // (spec.md §9's "phantom job" open question).
                debug!(remote_addr = %shared.remote_addr, "idle timeout; sending keepalive probe");
                let probe_shared = shared.clone();
                tokio::spawn(async move {
                    match bgapi_job_uuid(&probe_shared, constants::IDLE_PROBE_COMMAND, None, None).await {
                        Ok(uuid) => {
                            if let Ok(rx) = probe_shared.registry.register_job(uuid).await {
                                let _ = rx.await;
                            }
                        }
                        Err(e) => warn!(error = %e, "idle probe failed"),
                    }
                });
                continue;
            }
        }
    };

    shared.set_state(ConnectionState::Draining);
    shared.registry.fail_all(|| EslError::ConnectionClosed).await;
    shared.set_state(ConnectionState::Closed);
    listener.handle_disconnect_notice(shared.remote_addr.clone(), ctx).await;
    info!(remote_addr = %shared.remote_addr, cause = %teardown_cause, "ESL connection closed");

    if teardown_cause.is_fatal_for_connection() || matches!(teardown_cause, EslError::UnexpectedEof) {
        Err(teardown_cause)
    } else {
        Ok(())
    }
}

async fn dispatch_message(
    shared: &Arc<ConnectionShared>,
    message: EslMessage,
    ctx: &Context,
    ordered: &OrderedDispatcher,
    listener: &Arc<dyn Listener>,
) -> EslResult<()> {
    match message.content_type() {
        ContentType::TextEventPlain | ContentType::TextEventXml => {
            let event = EslEvent::from_message(&message)?;
            if event.is_event(constants::EVENT_BACKGROUND_JOB) {
                if let Some(uuid) = event.job_uuid() {
                    let delivered = shared.registry.complete_job(&uuid, event.clone()).await;
                    if !delivered {
                        // No one is awaiting this UUID (it came from
                        // `sendAsyncApiCommand`, which doesn't register a
                        // slot): surface it as an ordinary event.
                        ordered.push(ctx.clone(), event);
                    }
                } else {
                    warn!("BACKGROUND_JOB event missing Job-UUID; delivering as ordinary event");
                    ordered.push(ctx.clone(), event);
                }
            } else {
                ordered.push(ctx.clone(), event);
            }
            Ok(())
        }
        ContentType::ApiResponse | ContentType::CommandReply => {
            shared.registry.complete_next_api(Ok(message)).await;
            Ok(())
        }
        ContentType::AuthRequest => {
            // Not expected after the initial handshake in either mode;
            // forwarded to the listener for visibility rather than dropped.
            listener.handle_auth_request(ctx.clone()).await;
            Ok(())
        }
        ContentType::TextDisconnectNotice => Err(EslError::ConnectionClosed),
        ContentType::TextRudeRejection => Err(EslError::ConnectionClosed),
        ContentType::Unknown(raw) => {
            warn!(content_type = %raw, "unsupported content-type; dropping frame");
            Ok(())
        }
    }
}
