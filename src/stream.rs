//! Client-side connection handle

use crate::config::KcpConfig;
use crate::error::{KcpError, Result};
use crate::facade::EngineService;
use crate::handle::{HandleId, HandleState};
use crate::runtime::Engine;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// One logical KCP connection, bound to at most one engine stream over its
/// whole life.
///
/// A stream starts unbound; [`connect`](Self::connect) binds it exactly once.
/// Streams produced by [`KcpListener::accept`](crate::KcpListener::accept)
/// are bound from the start. Dropping a bound stream releases the engine
/// side in the background; [`close`](Self::close) does the same and waits.
///
/// The configuration is captured when the engine stream is created.
/// Changing it afterwards, including through
/// [`set_fastest_config`](Self::set_fastest_config), does not affect the
/// live connection.
pub struct KcpStream<E: EngineService = Engine> {
    engine: E,
    state: HandleState,
    remote_addr: String,
    config: KcpConfig,
}

impl<E: EngineService> KcpStream<E> {
    /// An unbound stream targeting `remote_addr` (`"host:port"`).
    pub fn new(engine: E, remote_addr: impl Into<String>) -> Self {
        Self::with_config(engine, remote_addr, KcpConfig::default())
    }

    pub fn with_config(engine: E, remote_addr: impl Into<String>, config: KcpConfig) -> Self {
        Self {
            engine,
            state: HandleState::Unbound,
            remote_addr: remote_addr.into(),
            config,
        }
    }

    /// Wrap a stream the engine has already registered.
    pub(crate) fn accepted(engine: E, id: HandleId, remote: SocketAddr, config: KcpConfig) -> Self {
        Self {
            engine,
            state: HandleState::Bound(id),
            remote_addr: remote.to_string(),
            config,
        }
    }

    /// Open the connection. Fails with [`KcpError::ReConnect`] if this stream
    /// was ever bound; engine failures leave it unbound so it can retry.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != HandleState::Unbound {
            return Err(KcpError::ReConnect);
        }

        let id = self
            .engine
            .create_connection(self.remote_addr.clone(), self.config.clone())
            .await?;
        self.state = HandleState::Bound(id);

        debug!(id, addr = %self.remote_addr, "stream connected");
        Ok(())
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data)).await
    }

    pub async fn write_bytes(&self, data: Bytes) -> Result<()> {
        let id = self.bound_id()?;
        self.engine.write_bytes(id, data).await
    }

    /// Wait for the next available bytes (at most
    /// [`READ_CHUNK`](crate::READ_CHUNK)). `Ok(None)` means the peer side
    /// ended.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let id = self.bound_id()?;
        self.engine.read_bytes(id).await
    }

    /// Read exactly `len` bytes. If the stream ends first this fails with
    /// [`KcpError::ShortRead`]; a partial buffer is never returned.
    pub async fn read_exact(&self, len: usize) -> Result<Bytes> {
        let id = self.bound_id()?;
        self.engine.read_exact_bytes(id, len).await
    }

    /// Push queued output onto the wire now. Says nothing about delivery.
    pub async fn flush(&self) -> Result<()> {
        let id = self.bound_id()?;
        self.engine.flush(id).await
    }

    /// Release the engine stream and wait for it to be unregistered.
    pub async fn close(&mut self) -> Result<()> {
        let id = self.bound_id()?;
        self.state = HandleState::Released;
        self.engine.close_stream(id).await
    }

    /// Switch the captured configuration to the fastest retransmission
    /// profile. Only affects a later [`connect`](Self::connect).
    pub fn set_fastest_config(&mut self) {
        if self.state.is_bound() {
            debug!(
                addr = %self.remote_addr,
                "fastest config set on a connected stream; live session unchanged"
            );
        }
        self.config.set_fastest();
    }

    pub fn config(&self) -> &KcpConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut KcpConfig {
        &mut self.config
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.state.id()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_bound()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn bound_id(&self) -> Result<HandleId> {
        match self.state {
            HandleState::Bound(id) => Ok(id),
            HandleState::Unbound => Err(KcpError::StreamNotConnected),
            HandleState::Released => Err(KcpError::StreamClosed),
        }
    }
}

impl<E: EngineService> Drop for KcpStream<E> {
    fn drop(&mut self) {
        if let Some(id) = self.state.release() {
            debug!(id, addr = %self.remote_addr, "releasing dropped stream");
            self.engine.release_stream(id);
        }
    }
}

impl<E: EngineService> fmt::Debug for KcpStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KcpStream")
            .field("state", &self.state)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
