//! Outbound-mode TCP acceptor (spec.md §4.H): FreeSWITCH's `socket`
//! dialplan application dials into this listener once per call leg.
//!
//! Grounded on `rust-billing-engine/src/esl/server.rs::EslServer` — bind,
//! loop `accept()`, spawn a per-connection task — generalized to hand each
//! accepted socket to `connection.rs::Connection::run_outbound` instead of
//! the teacher's inline byte-dispatch loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::listener::{Listener, ParallelDispatcher};

/// Accepts outbound-mode ESL sessions on a bound TCP socket. Each accepted
/// connection is driven to completion on its own spawned task; a connection
/// erroring or hanging up never affects the accept loop or its siblings.
pub struct EslServer {
    listener: Arc<dyn Listener>,
    parallel: Arc<ParallelDispatcher>,
    config: ConnectionConfig,
}

impl EslServer {
    pub fn new(listener: Arc<dyn Listener>) -> Self {
        Self {
            listener,
            parallel: Arc::new(ParallelDispatcher::default_sized()),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind `addr` and run the accept loop until the socket errors or the
    /// caller drops the returned future. Each accepted leg is handled on its
    /// own task (spec.md §4.H): `run()` never returns while the listener
    /// remains bindable.
    pub async fn run(self, addr: impl Into<SocketAddr>) -> std::io::Result<()> {
        let addr = addr.into();
        let tcp_listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "ESL outbound server listening");

        loop {
            let (socket, peer) = match tcp_listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept() failed; continuing");
                    continue;
                }
            };

            let listener = self.listener.clone();
            let parallel = self.parallel.clone();
            let config = self.config.clone();
            let remote_addr = peer.to_string();

            tokio::spawn(async move {
                if let Err(e) = Connection::run_outbound(socket, remote_addr.clone(), config, listener, parallel).await {
                    error!(remote_addr = %remote_addr, error = %e, "outbound connection ended with error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EslEvent;
    use crate::listener::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct CountingListener {
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Listener for CountingListener {
        async fn on_connect(&self, _ctx: Context, _event: EslEvent) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_accepts_and_handles_connection() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        drop(tcp_listener);

        let listener = Arc::new(CountingListener { connects: AtomicUsize::new(0) });
        let server = EslServer::new(listener.clone());

        tokio::spawn(async move {
            let _ = server.run(addr).await;
        });
        // Give the server a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"connect\n\n");
        socket.write_all(b"Content-Type: command/reply\n\n").await.unwrap();
        socket.write_all(b"Content-Type: text/disconnect-notice\n\n").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.connects.load(Ordering::SeqCst), 1);
    }
}
