//! Engine lifecycle: a dedicated tokio runtime plus the stream and listener
//! tables it owns.
//!
//! ```text
//!  caller executor              engine runtime
//!  ───────────────              ──────────────
//!  KcpStream::read ──spawn──▶  task: table lookup → session.read()
//!        ▲                            │
//!        └────── JoinHandle ◀─────────┘
//! ```
//!
//! Facade calls that touch sockets or the tables are spawned onto the engine
//! runtime and awaited through their `JoinHandle`, so callers on any executor
//! never block and never need the engine's reactor. Dropping such a call
//! aborts its task; if the task finished anyway, whatever it registered is
//! unregistered again. Reads only touch a session's channels and run on the
//! caller's task, so a dropped read leaves its bytes buffered.

use crate::config::KcpConfig;
use crate::error::{KcpError, Result};
use crate::facade::EngineService;
use crate::handle::HandleId;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::session::{KcpSession, SessionListener};
use crate::table::HandleTable;

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Sizing and shutdown behavior of the engine runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_threads: usize,
    pub thread_name: String,
    /// How long [`Engine::stop`] lets in-flight tasks wind down
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map_or(2, |n| n.get()),
            thread_name: "kcp-engine".to_string(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// State reachable from engine tasks. Tasks hold this, never the `Engine`,
/// so dropping the last `Engine` really shuts the runtime down.
struct EngineState {
    streams: HandleTable<KcpSession>,
    listeners: HandleTable<SessionListener>,
    metrics: EngineMetrics,
}

impl EngineState {
    fn stream(&self, id: HandleId) -> Result<Arc<KcpSession>> {
        self.streams.get(id).ok_or(KcpError::NoStreamForId { id })
    }

    fn listener(&self, id: HandleId) -> Result<Arc<SessionListener>> {
        self.listeners.get(id).ok_or(KcpError::NoListenerForId { id })
    }

    /// Unregister and close a stream. `false` if it was already gone.
    fn discard_stream(&self, id: HandleId) -> bool {
        match self.streams.remove(id) {
            Some(session) => {
                session.close();
                self.metrics.stream_closed();
                true
            }
            None => false,
        }
    }

    fn discard_listener(&self, id: HandleId) -> bool {
        match self.listeners.remove(id) {
            Some(listener) => {
                listener.close();
                self.metrics.listener_closed();
                true
            }
            None => false,
        }
    }
}

/// Undoes the registration made by a task whose caller stopped waiting.
type Reclaim<T> = Box<dyn FnOnce(T) + Send>;

/// Caller-side half of a spawned engine call. Dropping it before the task
/// completes aborts the task; a result that still slips through goes to
/// `reclaim` on the engine runtime.
struct EngineTask<T: Send + 'static> {
    task: Option<JoinHandle<Result<T>>>,
    runtime: Handle,
    reclaim: Option<Reclaim<T>>,
}

impl<T: Send + 'static> EngineTask<T> {
    async fn join(mut self) -> Result<T> {
        let Some(task) = self.task.as_mut() else {
            return Err(KcpError::internal("engine task joined twice"));
        };
        let result = task.await;
        self.task = None;
        joined(result)
    }
}

impl<T: Send + 'static> Drop for EngineTask<T> {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        if let Some(reclaim) = self.reclaim.take() {
            self.runtime.spawn(async move {
                if let Ok(Ok(value)) = task.await {
                    reclaim(value);
                }
            });
        }
    }
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(KcpError::EngineStopped),
        Err(e) => Err(KcpError::internal(format!("engine task failed: {e}"))),
    }
}

struct EngineInner {
    runtime: RwLock<Option<Runtime>>,
    state: Arc<EngineState>,
    config: EngineConfig,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let runtime = match self.runtime.get_mut() {
            Ok(runtime) => runtime.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Safe inside async contexts, unlike a plain drop
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("KCP engine dropped without stop, runtime shut down in background");
        }
    }
}

/// The running transport engine. Cheap to clone; every clone refers to the
/// same runtime and tables.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build the engine runtime. Must happen before any handle can connect
    /// or bind.
    pub fn start(config: EngineConfig) -> Result<Engine> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;

        info!(
            workers = config.worker_threads.max(1),
            thread_name = %config.thread_name,
            "KCP engine started"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                runtime: RwLock::new(Some(runtime)),
                state: Arc::new(EngineState {
                    streams: HandleTable::new(),
                    listeners: HandleTable::new(),
                    metrics: EngineMetrics::default(),
                }),
                config,
            }),
        })
    }

    /// Close every registered stream and listener, then shut the runtime
    /// down on a helper thread. Returns immediately; calling it again does
    /// nothing. Later operations fail with [`KcpError::EngineStopped`].
    pub fn stop(&self) {
        let runtime = match self.inner.runtime.write() {
            Ok(mut runtime) => runtime.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(runtime) = runtime else {
            return;
        };

        let state = &self.inner.state;
        let streams = state.streams.drain();
        let listeners = state.listeners.drain();
        for session in &streams {
            session.close();
            state.metrics.stream_closed();
        }
        for listener in &listeners {
            listener.close();
            state.metrics.listener_closed();
        }

        info!(
            streams = streams.len(),
            listeners = listeners.len(),
            "KCP engine stopping"
        );

        // Shutting a runtime down blocks, so it happens off the caller's thread
        let timeout = self.inner.config.shutdown_timeout;
        let (runtime_tx, runtime_rx) = std::sync::mpsc::channel::<Runtime>();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-shutdown", self.inner.config.thread_name))
            .spawn(move || {
                if let Ok(runtime) = runtime_rx.recv() {
                    drop(streams);
                    drop(listeners);
                    runtime.shutdown_timeout(timeout);
                    debug!("KCP engine runtime shut down");
                }
            });

        match spawned {
            Ok(_) => {
                if let Err(std::sync::mpsc::SendError(runtime)) = runtime_tx.send(runtime) {
                    runtime.shutdown_background();
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn shutdown thread, shutting down in background");
                runtime.shutdown_background();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        match self.inner.runtime.read() {
            Ok(runtime) => runtime.is_some(),
            Err(_) => false,
        }
    }

    /// Live streams at the time of the call. Advisory only.
    pub fn stream_count(&self) -> usize {
        self.inner.state.streams.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.listeners.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.state.metrics.snapshot()
    }

    fn spawn_on<F>(&self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = self
            .inner
            .runtime
            .read()
            .map_err(|_| KcpError::internal("engine runtime lock poisoned"))?;
        match runtime.as_ref() {
            Some(runtime) => Ok(runtime.spawn(fut)),
            None => Err(KcpError::EngineStopped),
        }
    }

    fn spawn_task<T, Fut>(&self, fut: Fut, reclaim: Option<Reclaim<T>>) -> Result<EngineTask<T>>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self
            .inner
            .runtime
            .read()
            .map_err(|_| KcpError::internal("engine runtime lock poisoned"))?;
        let runtime = guard.as_ref().ok_or(KcpError::EngineStopped)?;
        Ok(EngineTask {
            task: Some(runtime.spawn(fut)),
            runtime: runtime.handle().clone(),
            reclaim,
        })
    }

    /// Run `f` on the engine runtime and wait for its result. Dropping the
    /// returned future aborts the task.
    async fn run<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<EngineState>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_task(f(self.inner.state.clone()), None)?
            .join()
            .await
    }

    /// Like [`run`](Self::run), for calls that register something. If the
    /// caller is gone by the time the task finishes, `reclaim` gets the value.
    async fn run_reclaiming<T, F, Fut>(&self, reclaim: Reclaim<T>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<EngineState>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_task(f(self.inner.state.clone()), Some(reclaim))?
            .join()
            .await
    }

    /// Run `f` to completion on the engine runtime even if the caller stops
    /// waiting. Used for closes, which must not be half done.
    async fn run_detached<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<EngineState>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.spawn_on(f(self.inner.state.clone()))?;
        joined(task.await)
    }

    /// A stream for reading on the caller's task.
    fn readable_stream(&self, id: HandleId) -> Result<Arc<KcpSession>> {
        if !self.is_running() {
            return Err(KcpError::EngineStopped);
        }
        self.inner.state.stream(id)
    }

    fn reclaim_stream(&self) -> Reclaim<HandleId> {
        let state = self.inner.state.clone();
        Box::new(move |id| {
            if state.discard_stream(id) {
                debug!(id, "stream released, caller stopped waiting");
            }
        })
    }

    fn reclaim_listener(&self) -> Reclaim<HandleId> {
        let state = self.inner.state.clone();
        Box::new(move |id| {
            if state.discard_listener(id) {
                debug!(id, "listener released, caller stopped waiting");
            }
        })
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| KcpError::config(format!("no address found for {addr}")))
}

impl EngineService for Engine {
    async fn create_connection(&self, addr: String, config: KcpConfig) -> Result<HandleId> {
        let reclaim = self.reclaim_stream();
        self.run_reclaiming(reclaim, move |state| async move {
            config.validate()?;
            let remote = resolve(&addr).await?;
            let session = KcpSession::connect(remote, config).await?;
            let conv = session.conv();

            let id = state.streams.insert(session);
            state.metrics.stream_opened();
            debug!(id, conv = %conv, peer = %remote, "stream registered");
            Ok(id)
        })
        .await
    }

    async fn create_listener(&self, addr: String, config: KcpConfig) -> Result<HandleId> {
        let reclaim = self.reclaim_listener();
        self.run_reclaiming(reclaim, move |state| async move {
            config.validate()?;
            let local = resolve(&addr).await?;
            let listener = SessionListener::bind(local, config).await?;
            let bound = listener.local_addr();

            let id = state.listeners.insert(listener);
            state.metrics.listener_opened();
            debug!(id, addr = %bound, "listener registered");
            Ok(id)
        })
        .await
    }

    async fn write_bytes(&self, id: HandleId, data: Bytes) -> Result<()> {
        self.run(move |state| async move {
            let session = state.stream(id)?;
            let len = data.len();
            session.write(data).await?;
            state.metrics.record_write(len);
            Ok(())
        })
        .await
    }

    async fn read_bytes(&self, id: HandleId) -> Result<Option<Bytes>> {
        let session = self.readable_stream(id)?;
        let chunk = session.read().await?;
        if let Some(chunk) = &chunk {
            self.inner.state.metrics.record_read(chunk.len());
        }
        Ok(chunk)
    }

    async fn read_exact_bytes(&self, id: HandleId, len: usize) -> Result<Bytes> {
        let session = self.readable_stream(id)?;
        let data = session.read_exact(len).await?;
        self.inner.state.metrics.record_read(data.len());
        Ok(data)
    }

    async fn flush(&self, id: HandleId) -> Result<()> {
        self.run(move |state| async move { state.stream(id)?.flush().await })
            .await
    }

    async fn accept(&self, id: HandleId) -> Result<(HandleId, SocketAddr)> {
        let reclaim_stream = self.reclaim_stream();
        let reclaim: Reclaim<(HandleId, SocketAddr)> =
            Box::new(move |(stream_id, _)| reclaim_stream(stream_id));
        self.run_reclaiming(reclaim, move |state| async move {
            let listener = state.listener(id)?;
            let session = listener.accept().await?;
            let remote = session.remote_addr();

            let stream_id = state.streams.insert(session);
            state.metrics.stream_opened();
            state.metrics.connection_accepted();
            debug!(listener = id, id = stream_id, peer = %remote, "accepted stream registered");
            Ok((stream_id, remote))
        })
        .await
    }

    async fn local_address(&self, id: HandleId) -> Result<SocketAddr> {
        self.run(move |state| async move { Ok(state.listener(id)?.local_addr()) })
            .await
    }

    async fn close_stream(&self, id: HandleId) -> Result<()> {
        self.run_detached(move |state| async move {
            if !state.discard_stream(id) {
                return Err(KcpError::NoStreamForId { id });
            }
            debug!(id, "stream closed");
            Ok(())
        })
        .await
    }

    async fn close_listener(&self, id: HandleId) -> Result<()> {
        self.run_detached(move |state| async move {
            if !state.discard_listener(id) {
                return Err(KcpError::NoListenerForId { id });
            }
            debug!(id, "listener closed");
            Ok(())
        })
        .await
    }

    fn release_stream(&self, id: HandleId) {
        let state = self.inner.state.clone();
        let release = self.spawn_on(async move {
            if state.discard_stream(id) {
                debug!(id, "stream released");
            }
        });
        if release.is_err() {
            self.inner.state.metrics.release_skipped();
            debug!(id, "engine stopped, stream release skipped");
        }
    }

    fn release_listener(&self, id: HandleId) {
        let state = self.inner.state.clone();
        let release = self.spawn_on(async move {
            if state.discard_listener(id) {
                debug!(id, "listener released");
            }
        });
        if release.is_err() {
            self.inner.state.metrics.release_skipped();
            debug!(id, "engine stopped, listener release skipped");
        }
    }

    async fn live_stream_count(&self) -> Result<usize> {
        self.run(|state| async move { Ok(state.streams.len()) })
            .await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("streams", &self.stream_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
