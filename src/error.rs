//! Error types for kcp-bridge.
//!
//! [`KcpError`] extends [`kcp_core::KcpCoreError`] with I/O, configuration
//! and handle-lifecycle variants. Misuse errors are raised locally by the
//! handle types and never reach the engine.

use crate::handle::HandleId;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KcpError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum KcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Buffer error: {message}")]
    Buffer { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Stream ended after {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("No stream registered for handle {id}")]
    NoStreamForId { id: HandleId },

    #[error("No listener registered for handle {id}")]
    NoListenerForId { id: HandleId },

    #[error("Engine has been stopped")]
    EngineStopped,

    // -- Handle misuse --
    #[error("Stream is already connected")]
    ReConnect,

    #[error("Stream is not connected")]
    StreamNotConnected,

    #[error("Stream has been closed")]
    StreamClosed,

    #[error("Listener is already bound")]
    ReListen,

    #[error("Listener is not bound")]
    ListenerNotBound,

    #[error("Listener has been closed")]
    ListenerClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    Lost,
    Expired,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Lost => write!(f, "connection lost"),
            Self::Expired => write!(f, "session expired"),
        }
    }
}

// ── Bridge: kcp-core errors → KcpError ──────────────────────────────────

impl From<kcp_core::KcpCoreError> for KcpError {
    fn from(e: kcp_core::KcpCoreError) -> Self {
        match e {
            kcp_core::KcpCoreError::Protocol { message } => Self::Protocol { message },
            kcp_core::KcpCoreError::Buffer { message } => Self::Buffer { message },
            kcp_core::KcpCoreError::ConnectionLost => Self::Connection {
                kind: ConnectionError::Lost,
            },
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl KcpError {
    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn buffer(message: impl Into<String>) -> Self {
        Self::Buffer {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl KcpError {
    /// Raised by a handle without contacting the engine
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::ReConnect
                | Self::StreamNotConnected
                | Self::StreamClosed
                | Self::ReListen
                | Self::ListenerNotBound
                | Self::ListenerClosed
        )
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::EngineStopped)
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::Buffer { .. } => true,
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionError::Lost | ConnectionError::Closed
            } | Self::Internal { .. }
                | Self::EngineStopped
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => {
                matches!(kind, ConnectionError::Closed | ConnectionError::Expired)
            }
            Self::StreamClosed | Self::ListenerClosed | Self::ShortRead { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
