//! Inbound-mode end-to-end tests: we dial a mock FreeSWITCH server, it
//! greets with `auth/request`, and we authenticate, subscribe, and issue
//! commands against it (spec.md §8 scenarios 1 and 2).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use freeswitch_esl::{Connection, ConnectionConfig, Context, EslEvent, Listener, ParallelDispatcher};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
}

struct NullListener;
#[async_trait]
impl Listener for NullListener {}

/// Scenario 1 (spec.md §8): inbound auth handshake followed by a
/// synchronous `api` call resolving with the reply body.
#[tokio::test]
async fn inbound_auth_then_sync_api_command() {
    init_tracing();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = tcp.accept().await.unwrap();
        socket.write_all(b"Content-Type: auth/request\n\n").await.unwrap();

        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"auth ClueCon\n\n");
        socket
            .write_all(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await
            .unwrap();

        // event subscription from ConnectionConfig::event_filter
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"event plain ALL\n\n");
        socket.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"api status\n\n");
        socket
            .write_all(b"Content-Type: api/response\nContent-Length: 6\n\nSTATUS")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        socket.write_all(b"Content-Type: text/disconnect-notice\n\n").await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let listener = Arc::new(NullListener);
    let parallel = Arc::new(ParallelDispatcher::new(2));
    let mut config = ConnectionConfig::default();
    config.password = Some("ClueCon".to_string());
    config.event_filter = Some("ALL".to_string());

    let handle = Connection::run_inbound(stream, addr.to_string(), config, listener, parallel)
        .await
        .expect("inbound handshake should succeed");

    let reply = handle.api("status", None, None).await.unwrap();
    assert_eq!(reply, "STATUS");

    server.await.unwrap();
}

/// Scenario 2 (spec.md §8): a `bgapi` call's `Job-UUID` correlates with its
/// eventual `BACKGROUND_JOB` event, which is not additionally delivered to
/// the listener.
#[tokio::test]
async fn inbound_background_job_round_trip() {
    init_tracing();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();

    const JOB_UUID: &str = "11111111-1111-1111-1111-111111111111";

    let server = tokio::spawn(async move {
        let (mut socket, _) = tcp.accept().await.unwrap();
        socket.write_all(b"Content-Type: auth/request\n\n").await.unwrap();

        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"auth ClueCon\n\n");
        socket.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"event plain ALL\n\n");
        socket.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]).to_string();
        assert_eq!(line, "bgapi originate sofia/gw/x 1000\n\n");
        socket
            .write_all(
                format!(
                    "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {uuid}\nJob-UUID: {uuid}\n\n",
                    uuid = JOB_UUID
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let body = format!("Event-Name: BACKGROUND_JOB\nJob-UUID: {}\n\n", JOB_UUID);
        socket
            .write_all(format!("Content-Type: text/event-plain\nContent-Length: {}\n\n", body.len()).as_bytes())
            .await
            .unwrap();
        socket.write_all(body.as_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        socket.write_all(b"Content-Type: text/disconnect-notice\n\n").await.unwrap();
    });

    struct RecordingListener {
        events: AsyncMutex<Vec<String>>,
    }
    #[async_trait]
    impl Listener for RecordingListener {
        async fn handle_esl_event(&self, _ctx: Context, event: EslEvent) {
            self.events.lock().await.push(event.event_name().unwrap_or_default());
        }
    }

    let stream = TcpStream::connect(addr).await.unwrap();
    let listener = Arc::new(RecordingListener { events: AsyncMutex::new(Vec::new()) });
    let parallel = Arc::new(ParallelDispatcher::new(2));
    let mut config = ConnectionConfig::default();
    config.password = Some("ClueCon".to_string());
    config.event_filter = Some("ALL".to_string());

    let handle = Connection::run_inbound(stream, addr.to_string(), config, listener.clone(), parallel)
        .await
        .expect("inbound handshake should succeed");

    let (job_uuid, rx) = handle.bgapi_tracked("originate", Some("sofia/gw/x 1000"), None).await.unwrap();
    assert_eq!(job_uuid, JOB_UUID);

    let event = rx.await.unwrap().unwrap();
    assert_eq!(event.job_uuid(), Some(JOB_UUID.to_string()));

    server.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(listener.events.lock().await.is_empty());
}
