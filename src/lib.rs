//! FreeSWITCH Event Socket Library (ESL) client runtime.
//!
//! This crate speaks the FreeSWITCH Event Socket protocol in both of its
//! modes: inbound (we dial into FreeSWITCH and authenticate) and outbound
//! (FreeSWITCH dials into us via the `socket` dialplan application). It
//! owns the wire codec, command correlation, reconnection policy, and
//! listener dispatch; callers implement [`Listener`] and plug it into
//! either [`EslCluster`] (inbound, one supervised connection per
//! configured server) or [`EslServer`] (outbound, one accepted connection
//! per call leg).
//!
//! # Architecture
//!
//! ```text
//! FreeSWITCH
//!     |
//!     v
//! TcpStream  --codec.rs-->  EslMessage  --event.rs-->  EslEvent
//!                                |
//!                                v
//!                         connection.rs (state machine,
//!                         correlation registry, dispatch)
//!                          /                  \
//!                         v                    v
//!               OrderedDispatcher      ParallelDispatcher
//!               (handle_esl_event)     (on_connect / auth notice)
//! ```
//!
//! `client.rs` and `server.rs` sit above `connection.rs`: the former drives
//! a pool of inbound connections with backoff-and-retry, the latter
//! accepts outbound connections on a bound socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use freeswitch_esl::{EslCluster, Listener, ServerOption};
//! use std::sync::Arc;
//!
//! struct MyListener;
//! #[async_trait::async_trait]
//! impl Listener for MyListener {}
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = EslCluster::new(Arc::new(MyListener));
//!     cluster.add_server(ServerOption::new("127.0.0.1", 8021, "ClueCon")).await;
//! }
//! ```

pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod listener;
pub mod message;
pub mod options;
pub mod registry;
pub mod server;

pub use client::{Backoff, EslCluster};
pub use connection::{Connection, ConnectionConfig, ConnectionHandle, ConnectionMode, ConnectionState};
pub use error::{EslError, EslResult};
pub use event::EslEvent;
pub use listener::{Context, Listener, OrderedDispatcher, ParallelDispatcher};
pub use message::{ContentType, EslMessage, HeaderMap};
pub use options::{ServerOption, ServerOptions};
pub use registry::CorrelationRegistry;
pub use server::EslServer;
