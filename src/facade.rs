//! The asynchronous service behind every handle.
//!
//! [`KcpStream`](crate::KcpStream) and [`KcpListener`](crate::KcpListener)
//! only ever talk to an engine through this trait. [`Engine`](crate::Engine)
//! is the real implementation; tests substitute their own.

use crate::config::KcpConfig;
use crate::error::Result;
use crate::handle::HandleId;

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;

/// Handle-indexed transport service.
///
/// Every async operation runs on the engine's own runtime; the returned
/// futures are `Send` and can be awaited from any executor. Ids returned by
/// `create_*` and `accept` stay valid until released or closed.
pub trait EngineService: Clone + Send + Sync + 'static {
    /// Open a client connection to `addr` (`"host:port"`).
    fn create_connection(
        &self,
        addr: String,
        config: KcpConfig,
    ) -> impl Future<Output = Result<HandleId>> + Send;

    /// Bind a listener on `addr`; port 0 picks an ephemeral port.
    fn create_listener(
        &self,
        addr: String,
        config: KcpConfig,
    ) -> impl Future<Output = Result<HandleId>> + Send;

    fn write_bytes(&self, id: HandleId, data: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Next available data, or `None` at end of stream.
    fn read_bytes(&self, id: HandleId) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Exactly `len` bytes, or an error if the stream ends first.
    fn read_exact_bytes(
        &self,
        id: HandleId,
        len: usize,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    fn flush(&self, id: HandleId) -> impl Future<Output = Result<()>> + Send;

    /// Wait for an inbound connection. The new stream is already registered.
    fn accept(&self, id: HandleId) -> impl Future<Output = Result<(HandleId, SocketAddr)>> + Send;

    fn local_address(&self, id: HandleId) -> impl Future<Output = Result<SocketAddr>> + Send;

    /// Unregister and gracefully close a stream, waiting for the removal.
    fn close_stream(&self, id: HandleId) -> impl Future<Output = Result<()>> + Send;

    fn close_listener(&self, id: HandleId) -> impl Future<Output = Result<()>> + Send;

    /// Schedule removal of a stream and return immediately. Called from `Drop`.
    fn release_stream(&self, id: HandleId);

    fn release_listener(&self, id: HandleId);

    fn live_stream_count(&self) -> impl Future<Output = Result<usize>> + Send;
}
