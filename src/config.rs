//! Configuration types for kcp-bridge.
//!
//! [`KcpConfig`] extends the core [`NodeDelayConfig`] with session-level
//! settings (flush policy, keep-alive, expiry, listener limits). Handles
//! capture a clone at connect/bind time; later edits never reach a live
//! session.

use crate::error::{KcpError, Result};
use std::time::Duration;

// Re-export from kcp-core so users see a single NodeDelayConfig type.
pub use kcp_core::config::NodeDelayConfig;

// ── KcpConfig ───────────────────────────────────────────────────────────

/// Full KCP configuration: protocol settings plus session settings.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    // Protocol settings (forwarded to kcp-core engine)
    pub mtu: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub nodelay: NodeDelayConfig,
    pub max_retries: u32,
    pub stream_mode: bool,

    // Session settings (used only by the session actor)
    /// Flush immediately after every write instead of waiting for the next tick
    pub flush_write: bool,
    /// Flush ACKs immediately after every inbound datagram
    pub flush_acks_input: bool,
    /// Idle time before a window probe is sent as keep-alive
    pub keep_alive: Option<Duration>,
    /// Inbound silence after which the session ends
    pub session_expire: Option<Duration>,

    // Listener settings
    pub max_pending_connections: usize,
    /// Unaccepted connections older than this are discarded by `accept`
    pub pending_timeout: Duration,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            snd_wnd: 32,
            rcv_wnd: 128,
            nodelay: NodeDelayConfig::normal(),
            max_retries: 20,
            stream_mode: false,
            flush_write: true,
            flush_acks_input: false,
            keep_alive: Some(Duration::from_secs(30)),
            session_expire: Some(Duration::from_secs(90)),
            max_pending_connections: 256,
            pending_timeout: Duration::from_secs(30),
        }
    }
}

/// Extracts the 6 protocol-only fields that `KcpEngine` reads.
impl From<KcpConfig> for kcp_core::KcpCoreConfig {
    fn from(c: KcpConfig) -> Self {
        Self {
            mtu: c.mtu,
            snd_wnd: c.snd_wnd,
            rcv_wnd: c.rcv_wnd,
            nodelay: c.nodelay,
            max_retries: c.max_retries,
            stream_mode: c.stream_mode,
        }
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl KcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::fast();
        self
    }

    pub fn fastest_mode(mut self) -> Self {
        self.set_fastest();
        self
    }

    pub fn nodelay_config(mut self, config: NodeDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    // -- Session tuning --

    pub fn flush_write(mut self, enabled: bool) -> Self {
        self.flush_write = enabled;
        self
    }

    pub fn flush_acks_input(mut self, enabled: bool) -> Self {
        self.flush_acks_input = enabled;
        self
    }

    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn session_expire(mut self, expire: Option<Duration>) -> Self {
        self.session_expire = expire;
        self
    }

    pub fn max_pending_connections(mut self, max: usize) -> Self {
        self.max_pending_connections = max;
        self
    }

    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Overwrite the whole retransmission profile with
    /// [`NodeDelayConfig::fastest`]. The other fields are left alone.
    pub fn set_fastest(&mut self) {
        self.nodelay = NodeDelayConfig::fastest();
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        if self.mtu < 64 || self.mtu > 65535 {
            return Err(KcpError::config("MTU must be between 64 and 65535"));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(KcpError::config("Window sizes must be greater than 0"));
        }
        if self.nodelay.interval == 0 {
            return Err(KcpError::config("Update interval must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(KcpError::config("Max retries must be greater than 0"));
        }
        if self.max_pending_connections == 0 {
            return Err(KcpError::config(
                "Pending connection queue must hold at least one connection",
            ));
        }
        Ok(())
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl KcpConfig {
    pub fn file_transfer() -> Self {
        Self::default()
            .normal_mode()
            .window_size(256, 256)
            .mtu(1400)
            .stream_mode(true)
            .keep_alive(Some(Duration::from_secs(60)))
    }

    pub fn realtime() -> Self {
        Self::default()
            .fast_mode()
            .window_size(64, 64)
            .mtu(1200)
            .flush_acks_input(true)
            .keep_alive(Some(Duration::from_secs(10)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_fastest_overwrites_whole_profile() {
        let mut config =
            KcpConfig::new().nodelay_config(NodeDelayConfig::custom(false, 77, 9, false));
        config.set_fastest();

        assert!(config.nodelay.nodelay);
        assert_eq!(config.nodelay.interval, 10);
        assert_eq!(config.nodelay.resend, 2);
        assert!(config.nodelay.no_congestion_control);

        // idempotent
        let before = config.nodelay.clone();
        config.set_fastest();
        assert_eq!(config.nodelay, before);
    }

    #[test]
    fn set_fastest_keeps_other_fields() {
        let mut config = KcpConfig::new().mtu(1200).window_size(64, 256);
        config.set_fastest();
        assert_eq!(config.mtu, 1200);
        assert_eq!((config.snd_wnd, config.rcv_wnd), (64, 256));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(KcpConfig::default().validate().is_ok());
        assert!(KcpConfig::default().mtu(32).validate().is_err());
        assert!(KcpConfig::default().window_size(0, 32).validate().is_err());
        assert!(KcpConfig::default().max_retries(0).validate().is_err());
        assert!(KcpConfig::default()
            .nodelay_config(NodeDelayConfig::custom(true, 0, 2, true))
            .validate()
            .is_err());
        assert!(KcpConfig::default()
            .max_pending_connections(0)
            .validate()
            .is_err());
    }

    #[test]
    fn presets_are_valid() {
        for config in [
            KcpConfig::file_transfer(),
            KcpConfig::realtime(),
            KcpConfig::new().fastest_mode(),
        ] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn core_config_conversion() {
        let config = KcpConfig::new().fastest_mode().mtu(1000).stream_mode(true);
        let core: kcp_core::KcpCoreConfig = config.into();
        assert_eq!(core.mtu, 1000);
        assert!(core.stream_mode);
        assert_eq!(core.nodelay, NodeDelayConfig::fastest());
    }
}
