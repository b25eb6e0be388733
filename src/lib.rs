//! # kcp-bridge: handle-based KCP streams over a background engine
//!
//! Streams and listeners are plain values that map onto integer handles
//! inside a transport [`Engine`]. The engine owns its own tokio runtime, the
//! UDP sockets, and one actor per KCP conversation; the handles enforce
//! single-use connect/bind, fail fast while not yet bound, and release their
//! engine resources when dropped.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  kcp-bridge  (this crate)                 │
//! │                                           │
//! │  KcpStream / KcpListener  ← handles       │
//! │  EngineService            ← facade trait  │
//! │  Engine                   ← runtime+tables│
//! │  session                  ← actors, UDP   │
//! ├───────────────────────────────────────────┤
//! │  kcp-core  (dependency)                   │
//! │                                           │
//! │  KcpEngine   ← pure sync state machine    │
//! │  protocol    ← wire types & constants     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kcp_bridge::{Engine, EngineConfig, KcpListener, KcpStream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::start(EngineConfig::default())?;
//!
//!     let mut listener = KcpListener::new(engine.clone(), "127.0.0.1:0");
//!     listener.bind().await?;
//!     let addr = listener.local_addr().await?;
//!
//!     let mut client = KcpStream::new(engine.clone(), addr.to_string());
//!     client.set_fastest_config();
//!     client.connect().await?;
//!     client.write(b"ping").await?;
//!
//!     let server = listener.accept().await?;
//!     let msg = server.read_exact(4).await?;
//!     assert_eq!(&msg[..], b"ping");
//!
//!     engine.stop();
//!     Ok(())
//! }
//! ```

// ── Layer 1: Core protocol (re-exported from kcp-core) ─────────────────

/// Core protocol types, constants, and wire format.
pub use kcp_core::protocol;

/// Direct access to the standalone `kcp-core` crate.
pub use kcp_core;

// ── Layer 2: Configuration & errors ─────────────────────────────────────

pub mod config;
pub mod error;
pub use config::{KcpConfig, NodeDelayConfig};
pub use error::{ConnectionError, KcpError, Result};

// ── Layer 3: Engine (runtime, tables, sessions) ─────────────────────────

pub mod facade;
pub mod metrics;
pub mod runtime;
pub mod transport;
pub(crate) mod session;
pub(crate) mod table;

pub use facade::EngineService;
pub use metrics::MetricsSnapshot;
pub use runtime::{Engine, EngineConfig};
pub use session::READ_CHUNK;
pub use transport::{Transport, UdpTransport};

// ── Layer 4: Handles ────────────────────────────────────────────────────

pub mod handle;
pub mod listener;
pub mod stream;

pub use handle::{HandleId, HandleState};
pub use listener::KcpListener;
pub use stream::KcpStream;

// ── Version info ────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
