//! Handle state machine tests against a recording engine

mod common;

use bytes::Bytes;
use common::{init_tracing, Call, MockEngine, MOCK_PEER};
use futures::FutureExt;
use kcp_bridge::{KcpConfig, KcpError, KcpListener, KcpStream, NodeDelayConfig};

// ── Streams ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_connect_fails_without_engine_call() {
    init_tracing();
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");

    stream.connect().await.unwrap();
    let id = stream.handle_id().unwrap();

    let err = stream.connect().await.unwrap_err();
    assert!(matches!(err, KcpError::ReConnect));
    assert_eq!(stream.handle_id(), Some(id), "first binding untouched");
    assert_eq!(
        engine.calls(),
        vec![Call::CreateConnection("10.0.0.1:9000".into())]
    );
}

#[tokio::test]
async fn test_failed_connect_stays_unbound_and_can_retry() {
    let engine = MockEngine::new();
    engine.fail_next_create();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");

    let err = stream.connect().await.unwrap_err();
    assert!(matches!(err, KcpError::Io(_)), "engine error surfaced as-is");
    assert!(!stream.is_connected());

    stream.connect().await.unwrap();
    assert!(stream.is_connected());
    assert_eq!(engine.calls().len(), 2);
}

#[tokio::test]
async fn test_unbound_stream_operations_fail_immediately() {
    let engine = MockEngine::new();
    let stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");

    // Each future resolves on its first poll, without suspending
    let write = stream.write(b"ping").now_or_never().expect("no suspension");
    assert!(matches!(write, Err(KcpError::StreamNotConnected)));

    let read = stream.read().now_or_never().expect("no suspension");
    assert!(matches!(read, Err(KcpError::StreamNotConnected)));

    let exact = stream.read_exact(4).now_or_never().expect("no suspension");
    assert!(matches!(exact, Err(KcpError::StreamNotConnected)));

    let flush = stream.flush().now_or_never().expect("no suspension");
    assert!(matches!(flush, Err(KcpError::StreamNotConnected)));

    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_bound_stream_forwards_to_engine() {
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    stream.connect().await.unwrap();
    let id = stream.handle_id().unwrap();

    stream.write(b"ping").await.unwrap();
    assert_eq!(stream.read().await.unwrap().unwrap(), Bytes::from_static(b"data"));
    assert_eq!(stream.read_exact(3).await.unwrap().len(), 3);
    stream.flush().await.unwrap();

    assert_eq!(
        engine.calls()[1..],
        [
            Call::Write(id, Bytes::from_static(b"ping")),
            Call::Read(id),
            Call::ReadExact(id, 3),
            Call::Flush(id),
        ]
    );
}

#[tokio::test]
async fn test_fastest_config_reaches_engine() {
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    stream.set_fastest_config();
    stream.connect().await.unwrap();

    let seen = &engine.configs()[0];
    assert!(seen.nodelay.nodelay);
    assert_eq!(seen.nodelay.interval, 10);
    assert_eq!(seen.nodelay.resend, 2);
    assert!(seen.nodelay.no_congestion_control);
}

#[tokio::test]
async fn test_config_changes_after_connect_do_not_reach_engine() {
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    stream.connect().await.unwrap();

    stream.set_fastest_config();
    stream.config_mut().mtu = 500;

    assert_eq!(stream.config().nodelay, NodeDelayConfig::fastest());
    let seen = &engine.configs()[0];
    assert_eq!(seen.nodelay, NodeDelayConfig::normal());
    assert_eq!(seen.mtu, 1400);
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test]
async fn test_drop_bound_stream_releases_once() {
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    stream.connect().await.unwrap();
    let id = stream.handle_id().unwrap();

    drop(stream);
    assert_eq!(engine.released_streams(), vec![id]);
}

#[tokio::test]
async fn test_drop_unbound_stream_releases_nothing() {
    let engine = MockEngine::new();
    let stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    drop(stream);
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_close_then_drop_releases_nothing_more() {
    let engine = MockEngine::new();
    let mut stream = KcpStream::new(engine.clone(), "10.0.0.1:9000");
    stream.connect().await.unwrap();
    let id = stream.handle_id().unwrap();

    stream.close().await.unwrap();
    assert!(matches!(
        stream.write(b"late").await,
        Err(KcpError::StreamClosed)
    ));
    assert!(matches!(stream.connect().await, Err(KcpError::ReConnect)));
    assert!(matches!(stream.close().await, Err(KcpError::StreamClosed)));

    drop(stream);
    assert!(engine.released_streams().is_empty());
    assert_eq!(
        engine.calls(),
        vec![
            Call::CreateConnection("10.0.0.1:9000".into()),
            Call::CloseStream(id),
        ]
    );
}

// ── Listeners ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_bind_fails_without_engine_call() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::new(engine.clone(), "0.0.0.0:0");

    listener.bind().await.unwrap();
    assert!(matches!(listener.bind().await, Err(KcpError::ReListen)));
    assert_eq!(engine.calls(), vec![Call::CreateListener("0.0.0.0:0".into())]);
}

#[tokio::test]
async fn test_unbound_listener_operations_fail_immediately() {
    let engine = MockEngine::new();
    let listener = KcpListener::new(engine.clone(), "0.0.0.0:0");

    let accept = listener.accept().now_or_never().expect("no suspension");
    assert!(matches!(accept, Err(KcpError::ListenerNotBound)));

    let addr = listener.local_addr().now_or_never().expect("no suspension");
    assert!(matches!(addr, Err(KcpError::ListenerNotBound)));

    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_accepted_stream_is_bound_with_listener_config() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::with_config(
        engine.clone(),
        "0.0.0.0:0",
        KcpConfig::realtime(),
    );
    listener.bind().await.unwrap();
    let listener_id = listener.handle_id().unwrap();

    let mut stream = listener.accept().await.unwrap();
    assert!(stream.is_connected());
    assert_eq!(stream.remote_addr(), MOCK_PEER);
    assert_eq!(stream.config().mtu, KcpConfig::realtime().mtu);

    // accept bypasses connect entirely
    assert!(matches!(stream.connect().await, Err(KcpError::ReConnect)));
    assert_eq!(
        engine.calls(),
        vec![
            Call::CreateListener("0.0.0.0:0".into()),
            Call::Accept(listener_id),
        ]
    );

    let stream_id = stream.handle_id().unwrap();
    drop(stream);
    assert_eq!(engine.released_streams(), vec![stream_id]);
}

#[tokio::test]
async fn test_accepted_stream_keeps_bind_time_config() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::new(engine.clone(), "0.0.0.0:0");
    listener.bind().await.unwrap();

    listener.config_mut().mtu = 500;
    listener.set_fastest_config();

    let stream = listener.accept().await.unwrap();
    assert_eq!(stream.config().mtu, 1400);
    assert_eq!(stream.config().nodelay, NodeDelayConfig::normal());
    assert_eq!(engine.configs()[0].mtu, 1400);
}

#[tokio::test]
async fn test_local_addr_from_engine() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::new(engine.clone(), "0.0.0.0:0");
    listener.bind().await.unwrap();

    let addr = listener.local_addr().await.unwrap();
    assert_eq!(addr.to_string(), MOCK_PEER);
}

#[tokio::test]
async fn test_drop_bound_listener_releases_once() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::new(engine.clone(), "0.0.0.0:0");
    listener.bind().await.unwrap();
    let id = listener.handle_id().unwrap();

    drop(listener);
    assert_eq!(engine.released_listeners(), vec![id]);

    let unbound = KcpListener::new(engine.clone(), "0.0.0.0:0");
    drop(unbound);
    assert_eq!(engine.released_listeners(), vec![id]);
}

#[tokio::test]
async fn test_closed_listener_rejects_operations() {
    let engine = MockEngine::new();
    let mut listener = KcpListener::new(engine.clone(), "0.0.0.0:0");
    listener.bind().await.unwrap();

    listener.close().await.unwrap();
    assert!(matches!(listener.accept().await, Err(KcpError::ListenerClosed)));
    assert!(matches!(listener.bind().await, Err(KcpError::ReListen)));

    drop(listener);
    assert!(engine.released_listeners().is_empty());
}
