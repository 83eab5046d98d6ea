//! Error taxonomy of the connection manager

use thiserror::Error;

/// Everything that can go wrong around a broker connection.
///
/// The first six variants end up as text in the manager's error slot; none of
/// them is fatal and the manager stays usable afterwards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Transport could not even be constructed
    #[error("Connection failed: {0}")]
    TransportOpen(String),

    /// Asynchronous error reported by an open transport
    #[error("Connection failed: {0}")]
    Transport(String),

    /// Transport gave up waiting for the broker handshake
    #[error("Connection failed: connect timed out after {0}s")]
    TransportTimeout(u64),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Failed to publish: {0}")]
    Publish(String),

    /// The manager's own hard cap on the connecting state
    #[error("Connection timeout - check broker address and port")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    /// The manager task is gone; commands can no longer be delivered
    #[error("Connection manager is not running")]
    ManagerGone,
}

/// Failures at the transport boundary
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("{0}")]
    Rejected(String),

    #[error("transport is closed")]
    Closed,
}
