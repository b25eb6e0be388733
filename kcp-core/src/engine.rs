//! KCP ARQ state machine.
//!
//! [`KcpEngine`] is a faithful, allocation-conscious rendition of the classic
//! `ikcp` algorithm: UNA/ACK processing, RTO estimation, fast resend,
//! slow start / congestion avoidance, and zero-window probing. It never
//! touches a socket; produced datagrams accumulate until
//! [`drain_output`](KcpEngine::drain_output) is called.

use crate::config::KcpCoreConfig;
use crate::error::{KcpCoreError, KcpCoreResult};
use crate::protocol::constants::*;
use crate::protocol::*;

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct RttState {
    srtt: u32,
    rttvar: u32,
    rto: u32,
    min_rto: u32,
}

#[derive(Debug)]
struct WindowState {
    snd: u32,
    rcv: u32,
    rmt: u32,
    cwnd: u32,
    ssthresh: u32,
    incr: u32,
}

#[derive(Debug, Default)]
struct ProbeState {
    flags: u32,
    wait: u32,
    ts: Timestamp,
}

/// One side of a KCP conversation.
pub struct KcpEngine {
    conv: ConvId,
    config: KcpCoreConfig,
    mss: u32,
    interval: u32,

    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,

    rtt: RttState,
    wnd: WindowState,
    probe: ProbeState,

    snd_queue: VecDeque<KcpSegment>,
    rcv_queue: VecDeque<KcpSegment>,
    snd_buf: VecDeque<KcpSegment>,
    rcv_buf: VecDeque<KcpSegment>,
    ack_list: Vec<(SeqNum, Timestamp)>,

    output: Vec<Bytes>,
    stats: KcpStats,

    // Monotonic clock, offset by `clock_skew`
    epoch: Instant,
    clock_skew: u32,
    current: Timestamp,
    ts_flush: Timestamp,
    updated: bool,
    dead: bool,
}

impl KcpEngine {
    pub fn new(conv: ConvId, config: KcpCoreConfig) -> Self {
        let mss = config.mtu.saturating_sub(IKCP_OVERHEAD).max(1);
        let min_rto = if config.nodelay.nodelay {
            IKCP_RTO_NDL
        } else {
            IKCP_RTO_MIN
        };

        Self {
            conv,
            mss,
            interval: config.nodelay.interval.clamp(1, 5000),

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,

            rtt: RttState {
                srtt: 0,
                rttvar: 0,
                rto: IKCP_RTO_DEF,
                min_rto,
            },
            wnd: WindowState {
                snd: config.snd_wnd.max(1),
                // Fragment counts are bounded by IKCP_WND_RCV, so the receive
                // window must be able to hold a whole message.
                rcv: config.rcv_wnd.max(IKCP_WND_RCV),
                rmt: IKCP_WND_RCV,
                cwnd: 1,
                ssthresh: IKCP_THRESH_INIT,
                incr: mss,
            },
            probe: ProbeState::default(),

            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            ack_list: Vec::new(),

            output: Vec::new(),
            stats: KcpStats::default(),

            epoch: Instant::now(),
            clock_skew: 0,
            current: 0,
            ts_flush: 0,
            updated: false,
            dead: false,

            config,
        }
    }

    pub fn conv(&self) -> ConvId {
        self.conv
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// Largest payload a single [`send`](Self::send) accepts.
    pub fn max_message_size(&self) -> usize {
        if self.config.stream_mode {
            usize::MAX
        } else {
            self.mss as usize * (IKCP_WND_RCV as usize - 1)
        }
    }

    /// Queue application data. Nothing reaches the output until the next flush.
    pub fn send(&mut self, data: Bytes) -> KcpCoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mss = self.mss as usize;
        let count = data.len().div_ceil(mss);

        if !self.config.stream_mode && count >= IKCP_WND_RCV as usize {
            return Err(KcpCoreError::buffer(format!(
                "message of {} bytes needs {} fragments, limit is {}",
                data.len(),
                count,
                IKCP_WND_RCV - 1
            )));
        }

        for i in 0..count {
            let start = i * mss;
            let end = (start + mss).min(data.len());
            let frg = if self.config.stream_mode {
                0
            } else {
                (count - i - 1) as u8
            };
            self.snd_queue
                .push_back(KcpSegment::push(self.conv, frg, data.slice(start..end)));
        }

        self.stats.bytes_sent += data.len() as u64;
        trace!(conv = %self.conv, bytes = data.len(), fragments = count, "queued for sending");
        Ok(())
    }

    /// Pop the next complete message, if one has been reassembled.
    pub fn recv(&mut self) -> KcpCoreResult<Option<Bytes>> {
        let Some(size) = self.peek_size() else {
            return Ok(None);
        };

        let recover = self.rcv_queue.len() >= self.wnd.rcv as usize;

        let message = match self.rcv_queue.front() {
            Some(front) if front.header.frg == 0 => self
                .rcv_queue
                .pop_front()
                .map(|seg| seg.data)
                .unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(size);
                while let Some(seg) = self.rcv_queue.pop_front() {
                    buf.extend_from_slice(&seg.data);
                    if seg.header.frg == 0 {
                        break;
                    }
                }
                buf.freeze()
            }
        };

        self.move_to_rcv_queue();

        if recover && self.rcv_queue.len() < self.wnd.rcv as usize {
            self.probe.flags |= IKCP_ASK_TELL;
        }

        self.stats.bytes_received += message.len() as u64;
        Ok(Some(message))
    }

    /// Feed one datagram from the peer.
    pub fn input(&mut self, data: Bytes) -> KcpCoreResult<()> {
        if data.len() < KcpHeader::SIZE {
            return Err(KcpCoreError::protocol("datagram shorter than a KCP header"));
        }

        self.current = self.now();
        self.stats.packets_received += 1;

        let prev_una = self.snd_una;
        let mut max_ack: Option<SeqNum> = None;
        let mut buf = data;

        while buf.len() >= KcpHeader::SIZE {
            let Some(segment) = KcpSegment::decode(&mut buf) else {
                return Err(KcpCoreError::protocol("segment length overruns datagram"));
            };

            if segment.header.conv != self.conv {
                debug!(
                    conv = %self.conv,
                    packet_conv = %segment.header.conv,
                    "conversation id mismatch"
                );
                return Err(KcpCoreError::protocol("conversation id mismatch"));
            }
            if !segment.header.is_known_cmd() {
                return Err(KcpCoreError::protocol(format!(
                    "unknown command {}",
                    segment.header.cmd
                )));
            }

            let (cmd, wnd, ts, sn, una) = (
                segment.header.cmd,
                segment.header.wnd,
                segment.header.ts,
                segment.header.sn,
                segment.header.una,
            );

            self.wnd.rmt = wnd as u32;
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                IKCP_CMD_ACK => {
                    let rtt = time_diff(self.current, ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(sn);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        Some(prev) if !seq_after(sn, prev) => Some(prev),
                        _ => Some(sn),
                    };
                }
                IKCP_CMD_PUSH => {
                    if seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) {
                        self.ack_list.push((sn, ts));
                        if !seq_before(sn, self.rcv_nxt) {
                            self.parse_data(segment);
                        }
                    }
                }
                IKCP_CMD_WASK => {
                    self.probe.flags |= IKCP_ASK_TELL;
                }
                // IKCP_CMD_WINS carries nothing beyond the window already read
                _ => {}
            }
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }

        if seq_after(self.snd_una, prev_una) {
            self.grow_cwnd();
        }

        Ok(())
    }

    /// Flush on the configured interval. Call this often; it is cheap when
    /// nothing is due.
    pub fn update(&mut self) -> KcpCoreResult<()> {
        self.current = self.now();

        if !self.updated {
            self.updated = true;
            self.ts_flush = self.current;
        }

        let mut slap = time_diff(self.current, self.ts_flush);
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = self.current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(self.current, self.ts_flush) >= 0 {
                self.ts_flush = self.current.wrapping_add(self.interval);
            }
            self.flush_segments();
        }

        self.liveness()
    }

    /// Emit ACKs, probes, and every data segment that is due right now.
    pub fn flush(&mut self) -> KcpCoreResult<()> {
        self.current = self.now();
        self.flush_segments();
        self.liveness()
    }

    /// Take every datagram produced since the last drain.
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.output)
    }

    /// Ask the peer for its window on the next flush. Used as a keep-alive:
    /// the peer answers with a window-size segment.
    pub fn keep_alive_probe(&mut self) {
        self.probe.flags |= IKCP_ASK_SEND;
    }

    /// Segments queued or in flight
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    pub fn stats(&self) -> &KcpStats {
        &self.stats
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Shift the engine clock forward. Lets tests expire timers without sleeping.
    pub fn advance_clock(&mut self, ms: u32) {
        self.clock_skew = self.clock_skew.wrapping_add(ms);
    }

    fn now(&self) -> Timestamp {
        (self.epoch.elapsed().as_millis() as u32).wrapping_add(self.clock_skew)
    }

    fn liveness(&self) -> KcpCoreResult<()> {
        if self.dead {
            Err(KcpCoreError::ConnectionLost)
        } else {
            Ok(())
        }
    }

    fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.header.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.header.frg as usize + 1 {
            return None;
        }

        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.data.len();
            if seg.header.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    fn parse_una(&mut self, una: SeqNum) {
        while let Some(seg) = self.snd_buf.front() {
            if !seq_before(seg.header.sn, una) {
                break;
            }
            self.snd_buf.pop_front();
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.header.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        let mut hit = None;
        for (i, seg) in self.snd_buf.iter().enumerate() {
            if seg.header.sn == sn {
                hit = Some(i);
                break;
            }
            if seq_before(sn, seg.header.sn) {
                break;
            }
        }
        if let Some(i) = hit {
            self.snd_buf.remove(i);
        }
    }

    fn parse_fastack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for seg in self.snd_buf.iter_mut() {
            if seq_before(sn, seg.header.sn) {
                break;
            }
            if seg.header.sn != sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: KcpSegment) {
        let sn = segment.header.sn;

        if !seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) || seq_before(sn, self.rcv_nxt)
        {
            return;
        }

        let mut insert_at = self.rcv_buf.len();
        for (i, seg) in self.rcv_buf.iter().enumerate().rev() {
            if seg.header.sn == sn {
                // duplicate
                return;
            }
            if seq_after(sn, seg.header.sn) {
                break;
            }
            insert_at = i;
        }
        self.rcv_buf.insert(insert_at, segment);

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.header.sn != self.rcv_nxt || self.rcv_queue.len() >= self.wnd.rcv as usize {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn update_ack(&mut self, rtt: u32) {
        let rtt = rtt.min(IKCP_RTO_MAX);

        if self.rtt.srtt == 0 {
            self.rtt.srtt = rtt;
            self.rtt.rttvar = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rtt.srtt);
            self.rtt.rttvar = (3 * self.rtt.rttvar + delta) / 4;
            self.rtt.srtt = ((7 * self.rtt.srtt + rtt) / 8).max(1);
        }

        let rto = self.rtt.srtt + self.interval.max(4 * self.rtt.rttvar);
        self.rtt.rto = rto.clamp(self.rtt.min_rto, IKCP_RTO_MAX);

        self.stats.rtt = self.rtt.srtt;
        self.stats.rtt_var = self.rtt.rttvar;
        self.stats.rto = self.rtt.rto;
    }

    fn grow_cwnd(&mut self) {
        if self.wnd.cwnd >= self.wnd.rmt {
            return;
        }

        let mss = self.mss;
        if self.wnd.cwnd < self.wnd.ssthresh {
            self.wnd.cwnd += 1;
            self.wnd.incr = self.wnd.incr.saturating_add(mss);
        } else {
            if self.wnd.incr < mss {
                self.wnd.incr = mss;
            }
            let step = (mss as u64 * mss as u64 / self.wnd.incr as u64) as u32 + mss / 16;
            self.wnd.incr = self.wnd.incr.saturating_add(step);
            if (self.wnd.cwnd + 1).saturating_mul(mss) <= self.wnd.incr {
                self.wnd.cwnd = self.wnd.incr.div_ceil(mss);
            }
        }

        if self.wnd.cwnd > self.wnd.rmt {
            self.wnd.cwnd = self.wnd.rmt;
            self.wnd.incr = self.wnd.rmt.saturating_mul(mss);
        }
    }

    fn wnd_unused(&self) -> u32 {
        self.wnd.rcv.saturating_sub(self.rcv_queue.len() as u32)
    }

    fn flush_segments(&mut self) {
        let current = self.current;
        let mtu = self.config.mtu as usize;
        let wnd = self.wnd_unused().min(u16::MAX as u32) as u16;
        let mut buf = BytesMut::with_capacity(mtu);

        // Acknowledgements
        let mut ctl = KcpHeader::new(self.conv, IKCP_CMD_ACK);
        ctl.wnd = wnd;
        ctl.una = self.rcv_nxt;
        for (sn, ts) in std::mem::take(&mut self.ack_list) {
            if buf.len() + KcpHeader::SIZE > mtu {
                emit(&mut buf, &mut self.output, &mut self.stats);
            }
            ctl.sn = sn;
            ctl.ts = ts;
            ctl.encode(&mut buf);
        }

        // Zero-window probing
        if self.wnd.rmt == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = IKCP_PROBE_INIT;
                self.probe.ts = current.wrapping_add(self.probe.wait);
            } else if time_diff(current, self.probe.ts) >= 0 {
                self.probe.wait = self.probe.wait.max(IKCP_PROBE_INIT);
                self.probe.wait = (self.probe.wait + self.probe.wait / 2).min(IKCP_PROBE_LIMIT);
                self.probe.ts = current.wrapping_add(self.probe.wait);
                self.probe.flags |= IKCP_ASK_SEND;
            }
        } else {
            self.probe.ts = 0;
            self.probe.wait = 0;
        }

        for (flag, cmd) in [(IKCP_ASK_SEND, IKCP_CMD_WASK), (IKCP_ASK_TELL, IKCP_CMD_WINS)] {
            if self.probe.flags & flag != 0 {
                if buf.len() + KcpHeader::SIZE > mtu {
                    emit(&mut buf, &mut self.output, &mut self.stats);
                }
                ctl.cmd = cmd;
                ctl.sn = 0;
                ctl.ts = current;
                ctl.encode(&mut buf);
            }
        }
        self.probe.flags = 0;

        // Admit queued segments into the send window
        let mut cwnd = self.wnd.snd.min(self.wnd.rmt);
        if !self.config.nodelay.no_congestion_control {
            cwnd = cwnd.min(self.wnd.cwnd);
        }

        while seq_before(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.header.conv = self.conv;
            seg.header.cmd = IKCP_CMD_PUSH;
            seg.header.sn = self.snd_nxt;
            seg.resendts = current;
            seg.rto = self.rtt.rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        // (Re)transmit
        let resent = if self.config.nodelay.resend > 0 {
            self.config.nodelay.resend
        } else {
            u32::MAX
        };
        let rtomin = if self.config.nodelay.nodelay {
            0
        } else {
            self.rtt.rto >> 3
        };
        let nodelay = self.config.nodelay.nodelay;
        let rx_rto = self.rtt.rto;
        let dead_link = self.config.max_retries.max(1);
        let una = self.rcv_nxt;

        let mut lost = false;
        let mut change = false;

        for seg in self.snd_buf.iter_mut() {
            let needsend = if seg.xmit == 0 {
                seg.xmit = 1;
                seg.rto = rx_rto;
                seg.resendts = current.wrapping_add(seg.rto + rtomin);
                true
            } else if time_diff(current, seg.resendts) >= 0 {
                seg.xmit += 1;
                seg.rto = if nodelay {
                    seg.rto + seg.rto / 2
                } else {
                    seg.rto + seg.rto.max(rx_rto)
                }
                .min(IKCP_RTO_MAX);
                seg.resendts = current.wrapping_add(seg.rto);
                self.stats.retransmissions += 1;
                lost = true;
                true
            } else if seg.fastack >= resent && seg.xmit <= IKCP_FASTACK_LIMIT {
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                self.stats.fast_retransmissions += 1;
                change = true;
                true
            } else {
                false
            };

            if !needsend {
                continue;
            }

            seg.header.ts = current;
            seg.header.wnd = wnd;
            seg.header.una = una;

            if buf.len() + seg.size() > mtu {
                emit(&mut buf, &mut self.output, &mut self.stats);
            }
            seg.encode(&mut buf);

            if seg.xmit >= dead_link && !self.dead {
                warn!(conv = %self.conv, sn = seg.header.sn, xmit = seg.xmit, "dead link");
                self.dead = true;
            }
        }

        emit(&mut buf, &mut self.output, &mut self.stats);

        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.wnd.ssthresh = (inflight / 2).max(IKCP_THRESH_MIN);
            self.wnd.cwnd = self.wnd.ssthresh.saturating_add(resent);
            self.wnd.incr = self.wnd.cwnd.saturating_mul(self.mss);
        }

        if lost {
            self.wnd.ssthresh = (self.wnd.cwnd / 2).max(IKCP_THRESH_MIN);
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }

        if self.wnd.cwnd < 1 {
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }

        self.stats.snd_wnd = self.wnd.snd;
        self.stats.rcv_wnd = self.wnd.rcv;
        self.stats.cwnd = self.wnd.cwnd;
        self.stats.snd_buf_size = self.snd_buf.len() as u32;
        self.stats.rcv_buf_size = self.rcv_buf.len() as u32;
    }
}

/// Move the pending datagram, if any, to the output list.
fn emit(buf: &mut BytesMut, output: &mut Vec<Bytes>, stats: &mut KcpStats) {
    if !buf.is_empty() {
        output.push(buf.split().freeze());
        stats.packets_sent += 1;
    }
}
