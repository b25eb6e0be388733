//! Pure synchronous KCP protocol engine.
//!
//! No tokio, no async, no sockets: the engine consumes datagrams through
//! [`KcpEngine::input`] and hands datagrams back through
//! [`KcpEngine::drain_output`]. Whoever owns the engine decides how bytes
//! reach the wire and how often [`KcpEngine::update`] runs.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  kcp-core                   │
//! │                             │
//! │  protocol  ← wire types     │
//! │  config    ← tuning         │
//! │  error     ← 3 variants     │
//! │  engine    ← state machine  │
//! └─────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;

pub use config::{KcpCoreConfig, NodeDelayConfig};
pub use engine::KcpEngine;
pub use error::{KcpCoreError, KcpCoreResult};
pub use protocol::*;
