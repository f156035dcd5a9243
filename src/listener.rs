//! Listener dispatch (spec.md §4.E): routes parsed events and notices to
//! user callbacks on the right execution context. This split is
//! load-bearing — event ordering matters (`CHANNEL_ANSWER` before
//! `CHANNEL_HANGUP`), but concurrent connect handling must not serialize
//! behind one slow dialplan callback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, warn};

use crate::connection::ConnectionHandle;
use crate::event::EslEvent;

/// Lightweight handle passed to listener callbacks: a channel reference
/// back to the owning connection (for callbacks that want to issue further
/// commands), the remote address, and the configured default command
/// timeout. Borrowed for the duration of a callback; callers must not
/// retain it beyond connection lifetime.
#[derive(Clone)]
pub struct Context {
    handle: ConnectionHandle,
    remote_addr: String,
    default_timeout: Duration,
}

impl Context {
    pub fn new(handle: ConnectionHandle, remote_addr: String, default_timeout: Duration) -> Self {
        Self {
            handle,
            remote_addr,
            default_timeout,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// Capability set a caller implements. Every method has a no-op default so
/// an outbound-only consumer only needs `on_connect`/`handle_esl_event`,
/// and an inbound-only consumer only needs `handle_esl_event`/
/// `handle_auth_request`/`handle_disconnect_notice`.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Outbound mode only, called once per accepted session with the
    /// promoted `command/reply` as an `EslEvent`.
    async fn on_connect(&self, _ctx: Context, _event: EslEvent) {}

    /// Called in wire arrival order for every event not consumed
    /// internally as a background-job completion.
    async fn handle_esl_event(&self, _ctx: Context, _event: EslEvent) {}

    /// Inbound mode only; implementations must reply with `auth <pw>` via
    /// `ctx.handle()`.
    async fn handle_auth_request(&self, _ctx: Context) {}

    /// Terminal notification before the connection closes.
    async fn handle_disconnect_notice(&self, _remote_addr: String, _ctx: Context) {}
}

/// One worker task per connection, consuming an `mpsc` queue so delivery to
/// `handle_esl_event` matches wire arrival order and a slow listener
/// applies backpressure onto the queue rather than stalling the socket read
/// loop (spec.md §5: "no user-code callback runs on the I/O-read worker").
pub struct OrderedDispatcher {
    sender: mpsc::UnboundedSender<(Context, EslEvent)>,
}

impl OrderedDispatcher {
    pub fn spawn(listener: Arc<dyn Listener>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Context, EslEvent)>();
        tokio::spawn(async move {
            while let Some((ctx, event)) = rx.recv().await {
                listener.handle_esl_event(ctx, event).await;
            }
        });
        Self { sender: tx }
    }

    /// Push an event for ordered delivery. Never blocks the caller (the
    /// queue is unbounded) — the connection's read loop must not stall
    /// waiting on a slow consumer.
    pub fn push(&self, ctx: Context, event: EslEvent) {
        if self.sender.send((ctx, event)).is_err() {
            warn!("ordered dispatcher worker has exited; dropping event");
        }
    }
}

/// Bounded pool guarding spawned `on_connect` invocations, so many
/// simultaneous outbound connections don't serialize behind one slow
/// dialplan callback. Permit count defaults to `num_cpus::get()`, the same
/// sizing convention the teacher's binary crate uses for its own worker
/// pool.
pub struct ParallelDispatcher {
    semaphore: Arc<Semaphore>,
}

impl ParallelDispatcher {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn default_sized() -> Self {
        Self::new(num_cpus::get())
    }

    /// Spawn `on_connect` under a permit. The callback itself runs on its
    /// own spawned task so a panic inside it is caught by `tokio::spawn`'s
    /// unwind boundary and never propagates into the I/O pipeline — only
    /// logged.
    pub fn spawn_on_connect(&self, listener: Arc<dyn Listener>, ctx: Context, event: EslEvent) {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let remote_addr = ctx.remote_addr().to_string();
            let callback = tokio::spawn(async move {
                listener.on_connect(ctx, event).await;
            });
            if let Err(join_err) = callback.await {
                error!(remote_addr = %remote_addr, error = %join_err, "onConnect callback panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn dummy_context() -> Context {
        Context::new(ConnectionHandle::disconnected(), "127.0.0.1:8021".to_string(), Duration::from_secs(1))
    }

    fn dummy_event(name: &str) -> EslEvent {
        let mut h = HeaderMap::new();
        h.insert("Event-Name", name);
        EslEvent::new(h, None, false)
    }

    struct RecordingListener {
        order: StdMutex<Vec<String>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Listener for RecordingListener {
        async fn handle_esl_event(&self, _ctx: Context, event: EslEvent) {
            self.order.lock().unwrap().push(event.event_name().unwrap_or_default());
        }

        async fn on_connect(&self, _ctx: Context, _event: EslEvent) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_ordered_dispatch_preserves_order() {
        let listener = Arc::new(RecordingListener {
            order: StdMutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        });
        let dispatcher = OrderedDispatcher::spawn(listener.clone());

        for name in ["CHANNEL_CREATE", "CHANNEL_ANSWER", "CHANNEL_HANGUP_COMPLETE"] {
            dispatcher.push(dummy_context(), dummy_event(name));
        }

        // Give the worker task a chance to drain the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let order = listener.order.lock().unwrap().clone();
        assert_eq!(order, vec!["CHANNEL_CREATE", "CHANNEL_ANSWER", "CHANNEL_HANGUP_COMPLETE"]);
    }

    #[tokio::test]
    async fn test_parallel_dispatch_runs_all() {
        let listener = Arc::new(RecordingListener {
            order: StdMutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        });
        let dispatcher = ParallelDispatcher::new(2);

        for _ in 0..5 {
            dispatcher.spawn_on_connect(listener.clone(), dummy_context(), dummy_event("CHANNEL_CREATE"));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.connects.load(Ordering::SeqCst), 5);
    }
}
