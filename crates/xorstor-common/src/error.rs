//! Error types for Xorstor
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for Xorstor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Xorstor
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("store format version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: u64, expected: u64 },

    // Topology errors
    #[error("target topology changed: {0}")]
    TopologyChanged(String),

    #[error("too many targets: {count} exceeds the maximum of {max}")]
    TooManyTargets { count: usize, max: usize },

    // Scheduling errors
    #[error("work item capacity exceeded: {count} items, limit {limit}")]
    CapacityExceeded { count: usize, limit: usize },

    #[error("worker thread failure: {0}")]
    Thread(String),

    // Network errors
    #[error("peer {rank} disconnected")]
    Disconnected { rank: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // Input errors
    #[error("invalid change event: {0}")]
    InvalidEvent(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("scanner failed: {0}")]
    Scanner(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::TopologyChanged(msg.into())
    }

    /// Create a thread failure error
    pub fn thread(msg: impl Into<String>) -> Self {
        Self::Thread(msg.into())
    }

    /// Create a metadata store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Conditions that must abort the whole run rather than degrade.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. }
                | Self::TopologyChanged(_)
                | Self::TooManyTargets { .. }
                | Self::CapacityExceeded { .. }
                | Self::Thread(_)
                | Self::Configuration(_)
        )
    }

    /// Check if this error came from a lost peer connection
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::ConnectionFailed(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}
