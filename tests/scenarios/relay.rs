// ABOUTME: Request forwarding and reply relaying through a running proxy

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::fixtures::{config_for, read_frame, send_frame, FakeBackend, TestProxy, REPLY_ID_OFFSET};
use mongoproxy::proxy::OpCode;

#[tokio::test]
async fn test_query_reply_relayed_unchanged() {
    let backend = FakeBackend::spawn(Duration::ZERO).await.unwrap();
    let proxy = TestProxy::start(config_for(&backend)).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    send_frame(&mut client, 42, OpCode::Query, b"{find: users}").await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.op_code, OpCode::Reply);
    assert_eq!(reply.header.response_to, 42);
    assert_eq!(reply.header.request_id, REPLY_ID_OFFSET + 42);
    assert_eq!(reply.body, b"reply:{find: users}".to_vec());

    let frames = backend.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.request_id, 42);
    assert_eq!(frames[0].body, b"{find: users}".to_vec());

    proxy.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_insert_forwarded_without_reply() {
    let backend = FakeBackend::spawn(Duration::ZERO).await.unwrap();
    let proxy = TestProxy::start(config_for(&backend)).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    send_frame(&mut client, 1, OpCode::Insert, b"{_id: 1}").await.unwrap();
    backend.wait_for_frames(1).await.unwrap();

    // The connection is free for the next request; the only reply the
    // client ever sees belongs to the query
    send_frame(&mut client, 2, OpCode::Query, b"q").await.unwrap();
    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.response_to, 2);

    let frames = backend.frames();
    assert_eq!(frames[0].header.op_code, OpCode::Insert);
    assert_eq!(frames[0].body, b"{_id: 1}".to_vec());

    let metrics = &proxy.proxy.metrics().dispatch;
    assert_eq!(metrics.messages_dispatched.count(), 2);
    assert_eq!(metrics.replies_relayed.count(), 1);

    proxy.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_requests_on_one_connection_stay_ordered() {
    let backend = FakeBackend::spawn(Duration::from_millis(20)).await.unwrap();
    let proxy = TestProxy::start(config_for(&backend)).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    // Written back to back; several workers are free to pick them up
    send_frame(&mut client, 1, OpCode::Insert, b"a").await.unwrap();
    send_frame(&mut client, 2, OpCode::Update, b"b").await.unwrap();
    send_frame(&mut client, 3, OpCode::Delete, b"c").await.unwrap();
    send_frame(&mut client, 4, OpCode::Query, b"d").await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.response_to, 4);

    let ids: Vec<i32> = backend
        .frames()
        .iter()
        .map(|frame| frame.header.request_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    proxy.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_many_clients_share_few_backend_connections() {
    let backend = FakeBackend::spawn(Duration::from_millis(5)).await.unwrap();
    let mut config = config_for(&backend);
    config.max_backend_connections = 2;
    let proxy = TestProxy::start(config).await.unwrap();

    let mut clients = Vec::new();
    for id in 0..10 {
        let mut client = proxy.connect().await.unwrap();
        clients.push(tokio::spawn(async move {
            send_frame(&mut client, id, OpCode::Query, b"x").await.unwrap();
            read_frame(&mut client).await.unwrap()
        }));
    }

    for (id, client) in clients.into_iter().enumerate() {
        let reply = client.await.unwrap();
        assert_eq!(reply.header.response_to, id as i32);
    }

    let metrics = proxy.proxy.metrics();
    assert_eq!(metrics.dispatch.backend_connects.count(), 2);
    assert_eq!(metrics.listener.connections_accepted.count(), 10);

    proxy.proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_zero_listener_timeout_still_serves_requests() {
    let backend = FakeBackend::spawn(Duration::from_millis(20)).await.unwrap();
    let mut config = config_for(&backend);
    config.listener_timeout = Duration::ZERO;
    let proxy = TestProxy::start(config).await.unwrap();

    let mut client = proxy.connect().await.unwrap();
    send_frame(&mut client, 5, OpCode::Query, b"q").await.unwrap();
    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply.header.response_to, 5);

    proxy.proxy.stop().await.unwrap();
}
