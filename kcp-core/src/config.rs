//! Tuning knobs read by the KCP engine

/// Retransmission latency settings.
///
/// These four values map one-to-one onto the classic `ikcp_nodelay` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDelayConfig {
    /// Use the low minimum RTO and gentler backoff
    pub nodelay: bool,
    /// Update interval in milliseconds
    pub interval: u32,
    /// Duplicate-ACK count that triggers fast resend (0 disables it)
    pub resend: u32,
    /// Disable congestion control
    pub no_congestion_control: bool,
}

impl NodeDelayConfig {
    /// Plain KCP defaults
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: 40,
            resend: 0,
            no_congestion_control: false,
        }
    }

    /// Low latency with congestion control still on
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 20,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// The usual "fastest" profile: `nodelay=1, interval=10, resend=2, nc=1`.
    pub fn fastest() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion_control: true,
        }
    }

    pub fn custom(nodelay: bool, interval: u32, resend: u32, no_congestion_control: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion_control,
        }
    }
}

impl Default for NodeDelayConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Protocol-only configuration for [`KcpEngine`](crate::KcpEngine).
#[derive(Debug, Clone)]
pub struct KcpCoreConfig {
    /// Maximum datagram size, header included
    pub mtu: u32,
    /// Send window in segments
    pub snd_wnd: u32,
    /// Receive window in segments
    pub rcv_wnd: u32,
    pub nodelay: NodeDelayConfig,
    /// Transmissions of a single segment before the link counts as dead
    pub max_retries: u32,
    /// Byte-stream mode: no message boundaries, no fragment limit
    pub stream_mode: bool,
}

impl Default for KcpCoreConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            snd_wnd: 32,
            rcv_wnd: 128,
            nodelay: NodeDelayConfig::normal(),
            max_retries: 20,
            stream_mode: false,
        }
    }
}
