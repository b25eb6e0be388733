//! Error types for the KCP core protocol engine

use std::fmt;

/// Result type for KCP core operations
pub type KcpCoreResult<T> = std::result::Result<T, KcpCoreError>;

/// Errors produced by [`KcpEngine`](crate::KcpEngine).
#[derive(Debug)]
pub enum KcpCoreError {
    /// Malformed datagram or foreign conversation id
    Protocol { message: String },
    /// Message does not fit the receive window
    Buffer { message: String },
    /// A segment hit the retransmission limit
    ConnectionLost,
}

impl KcpCoreError {
    pub fn protocol(message: impl Into<String>) -> Self {
        KcpCoreError::Protocol {
            message: message.into(),
        }
    }

    pub fn buffer(message: impl Into<String>) -> Self {
        KcpCoreError::Buffer {
            message: message.into(),
        }
    }

    /// Whether the engine is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, KcpCoreError::ConnectionLost)
    }
}

impl fmt::Display for KcpCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KcpCoreError::Protocol { message } => write!(f, "Protocol error: {message}"),
            KcpCoreError::Buffer { message } => write!(f, "Buffer error: {message}"),
            KcpCoreError::ConnectionLost => write!(f, "Connection lost"),
        }
    }
}

impl std::error::Error for KcpCoreError {}
