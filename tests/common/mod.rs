//! Shared test helpers for kcp-bridge integration tests
#![allow(dead_code)]

use bytes::Bytes;
use kcp_bridge::{EngineService, HandleId, KcpConfig, KcpError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Install a fmt subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Every facade call the handle layer made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateConnection(String),
    CreateListener(String),
    Write(HandleId, Bytes),
    Read(HandleId),
    ReadExact(HandleId, usize),
    Flush(HandleId),
    Accept(HandleId),
    LocalAddress(HandleId),
    CloseStream(HandleId),
    CloseListener(HandleId),
    ReleaseStream(HandleId),
    ReleaseListener(HandleId),
    LiveStreamCount,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<Call>>,
    configs: Mutex<Vec<KcpConfig>>,
    next_id: AtomicU64,
    fail_next_create: AtomicBool,
}

/// In-memory [`EngineService`] that records calls and hands out sequential ids.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

pub const MOCK_PEER: &str = "127.0.0.1:4000";

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Configurations passed to `create_connection` / `create_listener`
    pub fn configs(&self) -> Vec<KcpConfig> {
        self.state.configs.lock().unwrap().clone()
    }

    pub fn released_streams(&self) -> Vec<HandleId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ReleaseStream(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn released_listeners(&self) -> Vec<HandleId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ReleaseListener(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// The next `create_*` call fails with an I/O error.
    pub fn fail_next_create(&self) {
        self.state.fail_next_create.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.state.calls.lock().unwrap().push(call);
    }

    fn create(&self, call: Call, config: KcpConfig) -> Result<HandleId> {
        self.record(call);
        if self.state.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(KcpError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "mock failure",
            )));
        }
        self.state.configs.lock().unwrap().push(config);
        Ok(self.next_id())
    }

    fn next_id(&self) -> HandleId {
        self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn peer() -> SocketAddr {
        MOCK_PEER.parse().unwrap()
    }
}

impl EngineService for MockEngine {
    async fn create_connection(&self, addr: String, config: KcpConfig) -> Result<HandleId> {
        self.create(Call::CreateConnection(addr), config)
    }

    async fn create_listener(&self, addr: String, config: KcpConfig) -> Result<HandleId> {
        self.create(Call::CreateListener(addr), config)
    }

    async fn write_bytes(&self, id: HandleId, data: Bytes) -> Result<()> {
        self.record(Call::Write(id, data));
        Ok(())
    }

    async fn read_bytes(&self, id: HandleId) -> Result<Option<Bytes>> {
        self.record(Call::Read(id));
        Ok(Some(Bytes::from_static(b"data")))
    }

    async fn read_exact_bytes(&self, id: HandleId, len: usize) -> Result<Bytes> {
        self.record(Call::ReadExact(id, len));
        Ok(Bytes::from(vec![7u8; len]))
    }

    async fn flush(&self, id: HandleId) -> Result<()> {
        self.record(Call::Flush(id));
        Ok(())
    }

    async fn accept(&self, id: HandleId) -> Result<(HandleId, SocketAddr)> {
        self.record(Call::Accept(id));
        Ok((self.next_id(), Self::peer()))
    }

    async fn local_address(&self, id: HandleId) -> Result<SocketAddr> {
        self.record(Call::LocalAddress(id));
        Ok(Self::peer())
    }

    async fn close_stream(&self, id: HandleId) -> Result<()> {
        self.record(Call::CloseStream(id));
        Ok(())
    }

    async fn close_listener(&self, id: HandleId) -> Result<()> {
        self.record(Call::CloseListener(id));
        Ok(())
    }

    fn release_stream(&self, id: HandleId) {
        self.record(Call::ReleaseStream(id));
    }

    fn release_listener(&self, id: HandleId) {
        self.record(Call::ReleaseListener(id));
    }

    async fn live_stream_count(&self) -> Result<usize> {
        self.record(Call::LiveStreamCount);
        Ok(0)
    }
}
