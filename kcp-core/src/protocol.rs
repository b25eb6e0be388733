//! KCP wire types, constants, and sequence arithmetic

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol constants shared with the reference C implementation
pub mod constants {
    pub const IKCP_RTO_NDL: u32 = 30; // no delay min rto
    pub const IKCP_RTO_MIN: u32 = 100; // normal min rto
    pub const IKCP_RTO_DEF: u32 = 200;
    pub const IKCP_RTO_MAX: u32 = 60000;
    pub const IKCP_CMD_PUSH: u8 = 81;
    pub const IKCP_CMD_ACK: u8 = 82;
    pub const IKCP_CMD_WASK: u8 = 83; // window probe (ask)
    pub const IKCP_CMD_WINS: u8 = 84; // window size (tell)
    pub const IKCP_ASK_SEND: u32 = 1;
    pub const IKCP_ASK_TELL: u32 = 2;
    pub const IKCP_WND_SND: u32 = 32;
    pub const IKCP_WND_RCV: u32 = 128;
    pub const IKCP_MTU_DEF: u32 = 1400;
    pub const IKCP_INTERVAL: u32 = 100;
    pub const IKCP_OVERHEAD: u32 = 24;
    pub const IKCP_DEADLINK: u32 = 20;
    pub const IKCP_THRESH_INIT: u32 = 2;
    pub const IKCP_THRESH_MIN: u32 = 2;
    pub const IKCP_PROBE_INIT: u32 = 7000;
    pub const IKCP_PROBE_LIMIT: u32 = 120000;
    pub const IKCP_FASTACK_LIMIT: u32 = 5;
}

/// Conversation ID type
pub type ConvId = u32;

/// Sequence number type
pub type SeqNum = u32;

/// Millisecond timestamp, wrapping
pub type Timestamp = u32;

/// A random, non-zero conversation id seeded from OS entropy.
pub fn random_conv_id() -> ConvId {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    loop {
        let id = RandomState::new().build_hasher().finish() as u32;
        if id != 0 {
            return id;
        }
    }
}

/// 24-byte segment header, little-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpHeader {
    pub conv: ConvId,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub sn: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl KcpHeader {
    pub const SIZE: usize = 24;

    pub fn new(conv: ConvId, cmd: u8) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Consume a header from the front of `buf`.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }

    /// Read only the conversation id without consuming anything.
    pub fn peek_conv(buf: &[u8]) -> Option<ConvId> {
        let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub fn cmd_str(&self) -> &'static str {
        match self.cmd {
            constants::IKCP_CMD_PUSH => "PUSH",
            constants::IKCP_CMD_ACK => "ACK",
            constants::IKCP_CMD_WASK => "WASK",
            constants::IKCP_CMD_WINS => "WINS",
            _ => "UNKNOWN",
        }
    }

    pub fn is_known_cmd(&self) -> bool {
        matches!(
            self.cmd,
            constants::IKCP_CMD_PUSH
                | constants::IKCP_CMD_ACK
                | constants::IKCP_CMD_WASK
                | constants::IKCP_CMD_WINS
        )
    }
}

/// Header plus payload, with the sender-side retransmission bookkeeping.
#[derive(Debug, Clone)]
pub struct KcpSegment {
    pub header: KcpHeader,
    pub data: Bytes,

    pub resendts: Timestamp,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl KcpSegment {
    pub fn new(conv: ConvId, cmd: u8, data: Bytes) -> Self {
        let mut header = KcpHeader::new(conv, cmd);
        header.len = data.len() as u32;

        Self {
            header,
            data,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }

    pub fn push(conv: ConvId, frg: u8, data: Bytes) -> Self {
        let mut seg = Self::new(conv, constants::IKCP_CMD_PUSH, data);
        seg.header.frg = frg;
        seg
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.extend_from_slice(&self.data);
    }

    /// Consume one segment from the front of a datagram. Returns `None` when
    /// the header is short or the declared payload length overruns the buffer.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        let header = KcpHeader::decode(buf)?;
        let len = header.len as usize;
        if buf.len() < len {
            return None;
        }
        let data = buf.split_to(len);

        Some(Self {
            header,
            data,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        })
    }

    pub fn size(&self) -> usize {
        KcpHeader::SIZE + self.data.len()
    }
}

/// Counters and gauges for a single engine
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmissions: u64,
    pub fast_retransmissions: u64,
    /// Smoothed RTT in milliseconds
    pub rtt: u32,
    pub rtt_var: u32,
    pub rto: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub cwnd: u32,
    pub snd_buf_size: u32,
    pub rcv_buf_size: u32,
}

/// Signed distance `later - earlier`, wrap-aware
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}
