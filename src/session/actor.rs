//! Session actor: owns the KcpEngine of one connection in a dedicated task,
//! communicates via channels. Zero locks on the hot path.

use crate::config::KcpConfig;
use crate::error::{ConnectionError, KcpError, Result};
use crate::transport::Transport;

use bytes::Bytes;
use kcp_core::KcpEngine;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Commands sent to the session actor.
pub(crate) enum SessionCmd {
    Send {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Clonable handle to the session actor.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    pub fn new(cmd_tx: mpsc::Sender<SessionCmd>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for the reply. Returns a connection-closed error
    /// if the actor has exited.
    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> SessionCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(reply))
            .await
            .map_err(|_| KcpError::connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| KcpError::connection(ConnectionError::Closed))
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.request(|reply| SessionCmd::Send { data, reply })
            .await?
    }

    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| SessionCmd::Flush { reply }).await?
    }

    /// Ask the actor to flush and stop. If the queue is full the actor still
    /// stops once every handle is gone and the queue drains.
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(SessionCmd::Close);
    }
}

#[derive(Debug, Clone, Copy)]
enum Exit {
    Closed,
    InputClosed,
    Expired,
    Lost,
}

/// Run the session actor loop.
///
/// - `input_rx`: raw datagrams from the receive pump (client) or listener (server).
/// - `data_tx`: reassembled payloads for readers; a dead link is reported
///   once as an error before the channel closes.
pub(crate) async fn run_session_actor<T: Transport>(
    mut engine: KcpEngine,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    mut input_rx: mpsc::Receiver<Bytes>,
    data_tx: mpsc::Sender<Result<Bytes>>,
    transport: Arc<T>,
    peer: T::Addr,
    config: KcpConfig,
) {
    let conv = engine.conv();
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.nodelay.interval.max(1) as u64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Writes stall once this many segments are queued or in flight
    let send_limit = (config.snd_wnd as usize).saturating_mul(2).max(1);
    let mut stalled: VecDeque<(Bytes, oneshot::Sender<Result<()>>)> = VecDeque::new();

    let mut last_input = Instant::now();
    let mut last_probe = Instant::now();

    // Server sessions may already have datagrams queued from the listener
    let _ = engine.update();
    flush_output(&mut engine, &transport, &peer).await;
    drain_recv(&mut engine, &data_tx);

    let exit = loop {
        tokio::select! {
            biased;

            // Periodic update tick (prioritized to avoid timer starvation)
            _ = interval.tick() => {
                if let Err(e) = engine.update() {
                    if e.is_fatal() {
                        error!(conv = %conv, peer = %peer, error = %e, "session engine failed");
                        break Exit::Lost;
                    }
                    warn!(conv = %conv, error = %e, "engine update failed (recoverable)");
                }

                if let Some(expire) = config.session_expire {
                    if last_input.elapsed() >= expire {
                        break Exit::Expired;
                    }
                }

                if let Some(keep_alive) = config.keep_alive {
                    if last_input.elapsed() >= keep_alive && last_probe.elapsed() >= keep_alive {
                        trace!(conv = %conv, "keep-alive probe");
                        engine.keep_alive_probe();
                        last_probe = Instant::now();
                    }
                }

                admit_stalled(&mut engine, &mut stalled, send_limit, config.flush_write);
                flush_output(&mut engine, &transport, &peer).await;
                drain_recv(&mut engine, &data_tx);
            }

            // User commands; paused while writes are stalled so order is kept
            cmd = cmd_rx.recv(), if stalled.is_empty() => {
                match cmd {
                    Some(SessionCmd::Send { data, reply }) => {
                        if engine.wait_snd() >= send_limit {
                            trace!(
                                conv = %conv,
                                waiting = engine.wait_snd(),
                                "send window full, write stalled"
                            );
                            stalled.push_back((data, reply));
                        } else {
                            let r = write(&mut engine, data, config.flush_write);
                            flush_output(&mut engine, &transport, &peer).await;
                            let _ = reply.send(r);
                        }
                    }
                    Some(SessionCmd::Flush { reply }) => {
                        let r = engine.flush().map_err(KcpError::from);
                        flush_output(&mut engine, &transport, &peer).await;
                        let _ = reply.send(r);
                    }
                    Some(SessionCmd::Close) | None => {
                        // Graceful shutdown: flush remaining data
                        let _ = engine.flush();
                        flush_output(&mut engine, &transport, &peer).await;
                        break Exit::Closed;
                    }
                }
            }

            // Incoming network packets
            packet = input_rx.recv() => {
                match packet {
                    Some(data) => {
                        last_input = Instant::now();
                        if let Err(e) = engine.input(data) {
                            trace!(conv = %conv, error = %e, "dropped datagram");
                        }
                        if config.flush_acks_input {
                            let _ = engine.flush();
                        }
                        admit_stalled(&mut engine, &mut stalled, send_limit, config.flush_write);
                        flush_output(&mut engine, &transport, &peer).await;
                        drain_recv(&mut engine, &data_tx);
                    }
                    None => break Exit::InputClosed,
                }
            }
        }
    };

    let stalled_error = match exit {
        Exit::Lost => {
            let _ = data_tx.try_send(Err(KcpError::connection(ConnectionError::Lost)));
            ConnectionError::Lost
        }
        Exit::Expired => ConnectionError::Expired,
        Exit::Closed | Exit::InputClosed => ConnectionError::Closed,
    };
    for (_, reply) in stalled {
        let _ = reply.send(Err(KcpError::connection(stalled_error.clone())));
    }

    debug!(conv = %conv, peer = %peer, reason = ?exit, "session actor stopped");
}

/// Queue one write, splitting payloads beyond the engine's message limit.
fn write(engine: &mut KcpEngine, data: Bytes, flush: bool) -> Result<()> {
    let max = engine.max_message_size();
    let mut rest = data;
    while rest.len() > max {
        engine.send(rest.split_to(max))?;
    }
    engine.send(rest)?;

    if flush {
        engine.flush()?;
    }
    Ok(())
}

/// Move stalled writes into the engine while the send window has room.
fn admit_stalled(
    engine: &mut KcpEngine,
    stalled: &mut VecDeque<(Bytes, oneshot::Sender<Result<()>>)>,
    send_limit: usize,
    flush: bool,
) {
    while engine.wait_snd() < send_limit {
        let Some((data, reply)) = stalled.pop_front() else {
            break;
        };
        let _ = reply.send(write(engine, data, flush));
    }
}

/// Send all buffered output packets over the transport.
async fn flush_output<T: Transport>(engine: &mut KcpEngine, transport: &Arc<T>, peer: &T::Addr) {
    for buf in engine.drain_output() {
        if let Err(e) = transport.send_to(&buf, peer).await {
            trace!(error = %e, "transport send_to failed");
        }
    }
}

/// Forward reassembled payloads to readers. Data stays in the engine while
/// the channel is full, which closes the receive window on the peer.
fn drain_recv(engine: &mut KcpEngine, data_tx: &mpsc::Sender<Result<Bytes>>) {
    while let Ok(permit) = data_tx.try_reserve() {
        match engine.recv() {
            Ok(Some(msg)) if msg.is_empty() => continue,
            Ok(Some(msg)) => permit.send(Ok(msg)),
            _ => break,
        }
    }
}
