//! End-to-end tests for the collector session against a scripted TCP server
//!
//! Each test binds a local listener and plays the collector side of the
//! protocol by hand: read a line, decide whether to acknowledge, observe what
//! the client does next.

use std::time::Duration;

use instrumental_core::{ClientIdentity, Collector, CollectorConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(port: u16) -> CollectorConfig {
    CollectorConfig::new("ik_test_key").with_endpoint("127.0.0.1", port)
}

fn test_identity() -> ClientIdentity {
    ClientIdentity {
        client_name: "instrumental-core".to_string(),
        client_version: "0.1.0".to_string(),
        platform: "TestOS".to_string(),
        platform_version: "1.0".to_string(),
        hostname: "test-host".to_string(),
    }
}

async fn accept(listener: &TcpListener) -> BufReader<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for client connection")
        .expect("accept failed");
    BufReader::new(stream)
}

async fn read_line(server: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(WAIT, server.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .expect("read failed");
    line
}

async fn send_ok(server: &mut BufReader<TcpStream>) {
    server.get_mut().write_all(b"ok\n").await.expect("write failed");
}

/// Poll a condition until it holds or the shared deadline passes
async fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================
// Handshake and flush
// ============================================

#[tokio::test]
async fn full_handshake_flushes_queued_metrics_in_order() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let collector = Collector::with_identity(test_config(port), test_identity()).unwrap();

    // Submitted before the handshake completes; must be buffered
    collector.increment_by("first", 2);
    collector.gauge("second", 1.5);

    let mut server = accept(&listener).await;

    let hello = read_line(&mut server).await;
    assert_eq!(
        hello,
        "hello version instrumental-core/0.1.0 platform TestOS/1.0 hostname test-host\n"
    );
    send_ok(&mut server).await;

    let auth = read_line(&mut server).await;
    assert_eq!(auth, "authenticate ik_test_key\n");
    send_ok(&mut server).await;

    // The buffered metrics arrive in call order
    let first = read_line(&mut server).await;
    assert!(first.starts_with("increment first 2 "), "got {:?}", first);
    let second = read_line(&mut server).await;
    assert!(second.starts_with("gauge second 1.5 "), "got {:?}", second);

    // Timestamps are fractional epoch seconds
    let ts: f64 = first.trim_end().rsplit(' ').next().unwrap().parse().unwrap();
    assert!(ts > 1_577_836_800.0);

    wait_until(|| collector.is_authenticated(), "authentication").await;
    assert_eq!(collector.pending_count(), 0);

    // New metrics now bypass the queue entirely
    collector.increment("third");
    let third = read_line(&mut server).await;
    assert!(third.starts_with("increment third 1 "), "got {:?}", third);
    assert_eq!(collector.pending_count(), 0);
}

#[tokio::test]
async fn prefix_is_applied_on_the_wire() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = test_config(port).with_prefix("app");
    let collector = Collector::with_identity(config, test_identity()).unwrap();
    collector.increment("x");

    let mut server = accept(&listener).await;
    read_line(&mut server).await;
    send_ok(&mut server).await;
    read_line(&mut server).await;
    send_ok(&mut server).await;

    let line = read_line(&mut server).await;
    assert!(line.starts_with("increment app.x 1 "), "got {:?}", line);
}

// ============================================
// Handshake failures
// ============================================

#[tokio::test]
async fn unexpected_hello_response_stalls_handshake() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let collector = Collector::with_identity(test_config(port), test_identity()).unwrap();

    let mut server = accept(&listener).await;
    let hello = read_line(&mut server).await;
    assert!(hello.starts_with("hello "));
    server.get_mut().write_all(b"error\n").await.unwrap();

    // The client must not answer a rejected hello with an authenticate line
    let mut buf = String::new();
    let res = timeout(Duration::from_millis(300), server.read_line(&mut buf)).await;
    assert!(res.is_err(), "expected silence, got {:?}", buf);

    assert!(!collector.is_authenticated());
    collector.increment("x");
    assert_eq!(collector.pending_count(), 1);
}

#[tokio::test]
async fn silent_server_times_out_and_client_recovers() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = test_config(port);
    config.response_timeout_secs = 1;
    let collector = Collector::with_identity(config, test_identity()).unwrap();

    // Swallow the hello and never acknowledge it
    let mut server = accept(&listener).await;
    let hello = read_line(&mut server).await;
    assert!(hello.starts_with("hello "));

    // The response read times out and the client tears the connection down;
    // the server observes EOF.
    let mut buf = String::new();
    let n = timeout(WAIT, server.read_line(&mut buf))
        .await
        .expect("timed out waiting for client close")
        .expect("read failed");
    assert_eq!(n, 0);
    wait_until(|| !collector.is_authenticated(), "reset").await;

    // The next metric write starts a fresh cycle
    collector.increment("after-timeout");
    let mut server = accept(&listener).await;
    let hello = read_line(&mut server).await;
    assert!(hello.starts_with("hello "), "got {:?}", hello);
}

// ============================================
// Disconnect and recovery
// ============================================

#[tokio::test]
async fn reconnects_and_reauthenticates_after_server_drop() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let collector = Collector::with_identity(test_config(port), test_identity()).unwrap();

    // First cycle
    let mut server = accept(&listener).await;
    read_line(&mut server).await;
    send_ok(&mut server).await;
    read_line(&mut server).await;
    send_ok(&mut server).await;
    wait_until(|| collector.is_authenticated(), "first authentication").await;

    // Collector goes away
    drop(server);
    wait_until(|| !collector.is_authenticated(), "disconnect reset").await;

    // The next write is buffered and triggers a reconnect
    collector.increment("offline");

    let mut server = accept(&listener).await;
    let hello = read_line(&mut server).await;
    assert!(hello.starts_with("hello "), "got {:?}", hello);
    send_ok(&mut server).await;
    let auth = read_line(&mut server).await;
    assert!(auth.starts_with("authenticate "), "got {:?}", auth);
    send_ok(&mut server).await;

    // The buffered metric from the outage arrives after re-authentication
    let line = read_line(&mut server).await;
    assert!(line.starts_with("increment offline 1 "), "got {:?}", line);
    wait_until(|| collector.is_authenticated(), "second authentication").await;
}

#[tokio::test]
async fn disconnect_flushes_pending_lines_before_closing() {
    instrumental_core::logging::init_test();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let collector = Collector::with_identity(test_config(port), test_identity()).unwrap();
    collector.increment("queued");

    let mut server = accept(&listener).await;
    let hello = read_line(&mut server).await;
    assert!(hello.starts_with("hello "));

    // Tear down from the client side before the handshake finishes
    collector.disconnect();

    // Best-effort flush: the queued line still goes out, then the socket
    // closes.
    let line = read_line(&mut server).await;
    assert!(line.starts_with("increment queued 1 "), "got {:?}", line);

    let mut buf = String::new();
    let n = timeout(WAIT, server.read_line(&mut buf))
        .await
        .expect("timed out waiting for close")
        .expect("read failed");
    assert_eq!(n, 0);
}
