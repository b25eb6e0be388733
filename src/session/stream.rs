//! One KCP conversation as seen by the engine: actor handle plus reader state

use super::actor::{run_session_actor, SessionHandle};
use super::{CMD_QUEUE, DATA_QUEUE, INPUT_QUEUE};
use crate::config::KcpConfig;
use crate::error::{KcpError, Result};
use crate::transport::{Transport, UdpTransport};

use bytes::{Bytes, BytesMut};
use kcp_core::{random_conv_id, ConvId, KcpEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Largest chunk handed out by a single [`KcpSession::read`]
pub const READ_CHUNK: usize = 65535;

pub(crate) struct KcpSession {
    handle: SessionHandle,
    reader: Mutex<SessionReader>,
    remote: SocketAddr,
    conv: ConvId,
    // Client sessions own their socket's receive loop
    pump: Option<JoinHandle<()>>,
}

impl KcpSession {
    /// Open a client session: own ephemeral socket, random conversation id.
    /// KCP has no handshake, so this returns as soon as the socket is ready.
    pub async fn connect(remote: SocketAddr, config: KcpConfig) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind_for(&remote).await?);
        let local = transport.local_addr()?;
        let conv = random_conv_id();

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let pump = tokio::spawn(receive_pump(transport.clone(), remote, input_tx));

        let session = Self::spawn(conv, transport, remote, input_rx, config, Some(pump));
        info!(conv = %conv, local = %local, peer = %remote, "KCP session opened");
        Ok(session)
    }

    /// Start the actor for a conversation whose datagrams arrive on `input_rx`.
    pub fn spawn<T: Transport<Addr = SocketAddr>>(
        conv: ConvId,
        transport: Arc<T>,
        remote: SocketAddr,
        input_rx: mpsc::Receiver<Bytes>,
        config: KcpConfig,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        let engine = KcpEngine::new(conv, config.clone().into());
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);

        tokio::spawn(run_session_actor(
            engine, cmd_rx, input_rx, data_tx, transport, remote, config,
        ));

        Self {
            handle: SessionHandle::new(cmd_tx),
            reader: Mutex::new(SessionReader {
                data_rx,
                pending: BytesMut::new(),
                eof: false,
            }),
            remote,
            conv,
            pump,
        }
    }

    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.handle.send(data).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.handle.flush().await
    }

    /// Next available bytes, at most [`READ_CHUNK`]. `None` is end of stream.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        self.reader.lock().await.read_chunk().await
    }

    pub async fn read_exact(&self, len: usize) -> Result<Bytes> {
        self.reader.lock().await.read_exact(len).await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn conv(&self) -> ConvId {
        self.conv
    }
}

impl Drop for KcpSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.handle.close();
        debug!(conv = %self.conv, peer = %self.remote, "KCP session dropped");
    }
}

/// Bytes received but not yet handed to a reader survive cancelled reads.
struct SessionReader {
    data_rx: mpsc::Receiver<Result<Bytes>>,
    pending: BytesMut,
    eof: bool,
}

impl SessionReader {
    /// Pull one payload into `pending`. `Ok(false)` at end of stream.
    async fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.data_rx.recv().await {
            Some(Ok(chunk)) => {
                self.pending.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(e)) => {
                self.eof = true;
                Err(e)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pending.is_empty() && !self.fill().await? {
            return Ok(None);
        }
        let n = self.pending.len().min(READ_CHUNK);
        Ok(Some(self.pending.split_to(n).freeze()))
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        while self.pending.len() < len {
            if !self.fill().await? {
                return Err(KcpError::ShortRead {
                    expected: len,
                    received: self.pending.len(),
                });
            }
        }
        Ok(self.pending.split_to(len).freeze())
    }
}

/// Forward datagrams from `remote` to the session; everything else is noise.
async fn receive_pump<T: Transport<Addr = SocketAddr>>(
    transport: Arc<T>,
    remote: SocketAddr,
    input_tx: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match transport.recv_from(&mut buf).await {
            Ok((size, from)) => {
                if from != remote {
                    trace!(from = %from, "ignoring datagram from unexpected peer");
                    continue;
                }
                match input_tx.try_send(Bytes::copy_from_slice(&buf[..size])) {
                    Ok(()) => {}
                    // ARQ recovers dropped datagrams
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(peer = %remote, "session input full, datagram dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                debug!(error = %e, peer = %remote, "receive pump stopped");
                break;
            }
        }
    }
}
