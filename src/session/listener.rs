//! Shared-socket listener: routes datagrams per peer and queues new
//! conversations for `accept`.

use super::stream::KcpSession;
use super::INPUT_QUEUE;
use crate::config::KcpConfig;
use crate::error::{ConnectionError, KcpError, Result};
use crate::transport::{Transport, UdpTransport};

use bytes::Bytes;
use dashmap::DashMap;
use kcp_core::constants::{IKCP_CMD_PUSH, IKCP_CMD_WASK};
use kcp_core::{ConvId, KcpSegment};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);
/// How long an ended conversation stays retired when sessions never expire
const RETIRE_FOR: Duration = Duration::from_secs(90);

/// A conversation seen by the listener but not yet accepted.
/// Its datagrams are already buffering in `input_rx`.
pub(crate) struct IncomingConnection {
    pub peer: SocketAddr,
    pub conv: ConvId,
    input_rx: mpsc::Receiver<Bytes>,
    created_at: Instant,
}

pub(crate) struct SessionListener {
    transport: Arc<UdpTransport>,
    local_addr: SocketAddr,
    config: KcpConfig,
    // Peer → session input, read on every datagram
    routes: Arc<DashMap<SocketAddr, Route>>,
    incoming: Mutex<mpsc::Receiver<IncomingConnection>>,
    listen_task: JoinHandle<()>,
}

impl SessionListener {
    pub async fn bind(addr: SocketAddr, config: KcpConfig) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(addr).await?);
        let local_addr = transport.local_addr()?;

        let routes = Arc::new(DashMap::new());
        let (incoming_tx, incoming_rx) = mpsc::channel(config.max_pending_connections.max(1));
        let router = Router::new(
            routes.clone(),
            incoming_tx,
            config.session_expire.unwrap_or(RETIRE_FOR),
        );

        let listen_task = tokio::spawn(listen_loop(transport.clone(), router));

        info!(addr = %local_addr, "KCP listener started");

        Ok(Self {
            transport,
            local_addr,
            config,
            routes,
            incoming: Mutex::new(incoming_rx),
            listen_task,
        })
    }

    /// Wait for the next conversation and start its session. Connections
    /// left waiting longer than `pending_timeout` are discarded.
    pub async fn accept(&self) -> Result<KcpSession> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let Some(conn) = incoming.recv().await else {
                return Err(KcpError::connection(ConnectionError::Closed));
            };

            if conn.created_at.elapsed() > self.config.pending_timeout {
                debug!(peer = %conn.peer, conv = %conn.conv, "discarding stale pending connection");
                continue;
            }

            let session = KcpSession::spawn(
                conn.conv,
                self.transport.clone(),
                conn.peer,
                conn.input_rx,
                self.config.clone(),
                None,
            );
            info!(peer = %conn.peer, conv = %conn.conv, "KCP connection accepted");
            return Ok(session);
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop receiving. Sessions accepted from this listener lose their input
    /// and end.
    pub fn close(&self) {
        self.listen_task.abort();
        self.routes.clear();
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.close();
        debug!(addr = %self.local_addr, "KCP listener dropped");
    }
}

#[derive(Clone)]
struct Route {
    conv: ConvId,
    input_tx: mpsc::Sender<Bytes>,
}

/// Per-datagram routing for one listener socket.
struct Router {
    routes: Arc<DashMap<SocketAddr, Route>>,
    // Ended conversations; their late datagrams must not reopen them
    retired: HashMap<(SocketAddr, ConvId), Instant>,
    retire_for: Duration,
    incoming_tx: mpsc::Sender<IncomingConnection>,
}

impl Router {
    fn new(
        routes: Arc<DashMap<SocketAddr, Route>>,
        incoming_tx: mpsc::Sender<IncomingConnection>,
        retire_for: Duration,
    ) -> Self {
        Self {
            routes,
            retired: HashMap::new(),
            retire_for,
            incoming_tx,
        }
    }

    /// Hand a datagram to its session, or start tracking a new conversation.
    /// Returns `false` once nobody accepts anymore.
    fn route(&mut self, peer: SocketAddr, data: Bytes) -> bool {
        // Clone the route out so no map guard is held while removing
        let route = self.routes.get(&peer).map(|r| r.value().clone());
        let data = match route {
            Some(route) => match route.input_tx.try_send(data) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    trace!(peer = %peer, "session input full, datagram dropped");
                    return true;
                }
                Err(TrySendError::Closed(data)) => {
                    self.routes.remove(&peer);
                    self.retire(peer, route.conv);
                    debug!(peer = %peer, conv = %route.conv, "session ended, route retired");
                    data
                }
            },
            None => data,
        };

        self.queue_connection(peer, data)
    }

    fn queue_connection(&mut self, peer: SocketAddr, data: Bytes) -> bool {
        let Some(conv) = opening_conv(&data) else {
            trace!(peer = %peer, size = data.len(), "ignoring datagram that opens no conversation");
            return true;
        };
        if self.is_retired(peer, conv) {
            trace!(peer = %peer, conv = %conv, "ignoring datagram for an ended conversation");
            return true;
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let _ = input_tx.try_send(data);

        let conn = IncomingConnection {
            peer,
            conv,
            input_rx,
            created_at: Instant::now(),
        };

        match self.incoming_tx.try_send(conn) {
            Ok(()) => {
                self.routes.insert(peer, Route { conv, input_tx });
                debug!(peer = %peer, conv = %conv, "new connection pending");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(peer = %peer, conv = %conv, "accept queue full, dropping connection");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn retire(&mut self, peer: SocketAddr, conv: ConvId) {
        self.retired.insert((peer, conv), Instant::now());
    }

    fn is_retired(&self, peer: SocketAddr, conv: ConvId) -> bool {
        self.retired
            .get(&(peer, conv))
            .is_some_and(|at| at.elapsed() < self.retire_for)
    }

    /// Retire routes whose session ended and forget old retirements.
    fn cleanup(&mut self) {
        let mut ended = Vec::new();
        self.routes.retain(|peer, route| {
            if route.input_tx.is_closed() {
                ended.push((*peer, route.conv));
                false
            } else {
                true
            }
        });
        for (peer, conv) in ended {
            self.retire(peer, conv);
        }

        let retire_for = self.retire_for;
        self.retired.retain(|_, at| at.elapsed() < retire_for);
    }
}

async fn listen_loop(transport: Arc<UdpTransport>, mut router: Router) {
    let mut buf = vec![0u8; 65536];
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            recv = transport.recv_from(&mut buf) => {
                let (size, peer) = match recv {
                    Ok(r) => r,
                    // ICMP errors from earlier sends surface here on some platforms
                    Err(e) if is_icmp_error(&e) => {
                        trace!(error = %e, "ignoring ICMP error");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "listener socket failed");
                        break;
                    }
                };

                if !router.route(peer, Bytes::copy_from_slice(&buf[..size])) {
                    break;
                }
            }

            _ = cleanup.tick() => {
                if router.incoming_tx.is_closed() {
                    break;
                }
                router.cleanup();
            }
        }
    }

    debug!("listener loop stopped");
}

fn is_icmp_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused)
}

/// Conversation id of a datagram that can start a session: it must decode
/// and lead with data or a window probe. Stray ACKs open nothing.
fn opening_conv(data: &Bytes) -> Option<ConvId> {
    let mut probe = data.clone();
    let segment = KcpSegment::decode(&mut probe)?;
    match segment.header.cmd {
        IKCP_CMD_PUSH | IKCP_CMD_WASK => Some(segment.header.conv),
        _ => None,
    }
}
