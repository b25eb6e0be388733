//! Server-side listener handle

use crate::config::KcpConfig;
use crate::error::{KcpError, Result};
use crate::facade::EngineService;
use crate::handle::{HandleId, HandleState};
use crate::runtime::Engine;
use crate::stream::KcpStream;

use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// A bound address accepting KCP conversations.
///
/// Same single-use rules as [`KcpStream`]: [`bind`](Self::bind) succeeds at
/// most once, and dropping a bound listener releases it in the background.
/// Closing a listener ends the streams accepted from it, since they share
/// its socket.
pub struct KcpListener<E: EngineService = Engine> {
    engine: E,
    state: HandleState,
    bind_addr: String,
    config: KcpConfig,
    // What the engine listener was created with; accepted streams carry it
    bound_config: Option<KcpConfig>,
}

impl<E: EngineService> KcpListener<E> {
    /// An unbound listener for `bind_addr`. Port 0 picks an ephemeral port;
    /// see [`local_addr`](Self::local_addr).
    pub fn new(engine: E, bind_addr: impl Into<String>) -> Self {
        Self::with_config(engine, bind_addr, KcpConfig::default())
    }

    pub fn with_config(engine: E, bind_addr: impl Into<String>, config: KcpConfig) -> Self {
        Self {
            engine,
            state: HandleState::Unbound,
            bind_addr: bind_addr.into(),
            config,
            bound_config: None,
        }
    }

    pub async fn bind(&mut self) -> Result<()> {
        if self.state != HandleState::Unbound {
            return Err(KcpError::ReListen);
        }

        let config = self.config.clone();
        let id = self
            .engine
            .create_listener(self.bind_addr.clone(), config.clone())
            .await?;
        self.state = HandleState::Bound(id);
        self.bound_config = Some(config);

        debug!(id, addr = %self.bind_addr, "listener bound");
        Ok(())
    }

    /// Wait for the next inbound connection. The returned stream is already
    /// connected and carries the configuration this listener was bound with.
    pub async fn accept(&self) -> Result<KcpStream<E>> {
        let id = self.bound_id()?;
        let (stream_id, remote) = self.engine.accept(id).await?;
        let config = self
            .bound_config
            .clone()
            .unwrap_or_else(|| self.config.clone());
        Ok(KcpStream::accepted(self.engine.clone(), stream_id, remote, config))
    }

    /// The address actually bound, with any wildcard port resolved.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        let id = self.bound_id()?;
        self.engine.local_address(id).await
    }

    pub async fn close(&mut self) -> Result<()> {
        let id = self.bound_id()?;
        self.state = HandleState::Released;
        self.engine.close_listener(id).await
    }

    /// Only affects a later [`bind`](Self::bind); a bound listener keeps
    /// handing out its bind-time configuration.
    pub fn set_fastest_config(&mut self) {
        self.config.set_fastest();
    }

    pub fn config(&self) -> &KcpConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut KcpConfig {
        &mut self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.state.id()
    }

    pub fn is_bound(&self) -> bool {
        self.state.is_bound()
    }

    fn bound_id(&self) -> Result<HandleId> {
        match self.state {
            HandleState::Bound(id) => Ok(id),
            HandleState::Unbound => Err(KcpError::ListenerNotBound),
            HandleState::Released => Err(KcpError::ListenerClosed),
        }
    }
}

impl<E: EngineService> Drop for KcpListener<E> {
    fn drop(&mut self) {
        if let Some(id) = self.state.release() {
            debug!(id, addr = %self.bind_addr, "releasing dropped listener");
            self.engine.release_listener(id);
        }
    }
}

impl<E: EngineService> fmt::Debug for KcpListener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KcpListener")
            .field("state", &self.state)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}
