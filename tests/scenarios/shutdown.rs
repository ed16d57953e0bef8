// ABOUTME: Graceful shutdown with a request in flight

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::fixtures::{config_for, is_closed, read_frame, send_frame, FakeBackend, TestProxy};
use mongoproxy::proxy::{ListenerState, OpCode};

#[tokio::test]
async fn test_stop_waits_for_in_flight_request() {
    let backend = FakeBackend::spawn(Duration::from_millis(300)).await.unwrap();
    let mut config = config_for(&backend);
    config.listener_timeout = Duration::from_secs(2);
    let proxy = TestProxy::start(config).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    send_frame(&mut client, 7, OpCode::Query, b"slow").await.unwrap();
    backend.wait_for_frames(1).await.unwrap();

    let started = Instant::now();
    let stopping = tokio::spawn({
        let proxy = Arc::clone(&proxy.proxy);
        async move { proxy.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Listen socket is closed while the drain is in progress
    assert!(TcpStream::connect(proxy.addr).await.is_err());
    assert_eq!(
        proxy.proxy.listener().unwrap().state(),
        ListenerState::Stopping
    );

    // The in-flight request still completes, then the connection closes
    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.response_to, 7);
    assert!(is_closed(&mut client).await);

    stopping.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(proxy.proxy.listener().unwrap().state(), ListenerState::Stopped);
    proxy.serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_returns_after_drain_timeout() {
    let backend = FakeBackend::spawn(Duration::from_secs(3)).await.unwrap();
    let mut config = config_for(&backend);
    config.listener_timeout = Duration::from_millis(300);
    config.dispatcher_timeout = Duration::from_secs(5);
    let proxy = TestProxy::start(config).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    send_frame(&mut client, 1, OpCode::Query, b"").await.unwrap();
    backend.wait_for_frames(1).await.unwrap();

    let started = Instant::now();
    proxy.proxy.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(2500));

    // No reply ever reaches the client
    assert!(is_closed(&mut client).await);
}

#[tokio::test]
async fn test_idle_connections_closed_on_stop() {
    let backend = FakeBackend::spawn(Duration::ZERO).await.unwrap();
    let proxy = TestProxy::start(config_for(&backend)).await.unwrap();

    let mut idle = proxy.connect().await.unwrap();
    send_frame(&mut idle, 1, OpCode::Query, b"").await.unwrap();
    read_frame(&mut idle).await.unwrap();

    proxy.proxy.stop().await.unwrap();
    assert!(is_closed(&mut idle).await);

    let metrics = proxy.proxy.metrics();
    assert_eq!(metrics.listener.connections_accepted.count(), 1);
    assert_eq!(metrics.listener.connections_dropped.count(), 1);
    assert_eq!(metrics.dispatch.workers_active.value(), 0);
}
