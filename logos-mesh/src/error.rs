//! Error taxonomy for the mesh client.
//!
//! Every failure the client can surface is one [`MeshError`] variant.
//! Callers that need to branch on the category match on
//! [`MeshError::kind`] instead of downcasting.
//!
//! ```text
//! Configuration  ── fatal, raised by MeshConfigBuilder::build()
//! Connection     ── transport failure, `retryable` separates transient loss
//!                   from terminal rejection (fatal close code, destroyed)
//! Message        ── one malformed inbound payload, logged and dropped
//! QueueOverflow  ── reported through MeshEvent, never returned from set()
//! Signaling / P2PHandshake / TopologyDegraded
//!                ── mesh-specific, recoverable, reported through events
//! SyncCoreInit   ── fatal, moves the client to ERROR
//! ```

use crate::protocol::DecodeError;

/// Category of a [`MeshError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Message,
    QueueOverflow,
    Signaling,
    P2PHandshake,
    TopologyDegraded,
    SyncCoreInit,
    Storage,
}

/// Errors produced by the mesh client and its components.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        retryable: bool,
        close_code: Option<u16>,
    },

    #[error("Malformed message: {0}")]
    Message(#[from] DecodeError),

    #[error("Offline queue full: dropped oldest entry for key '{dropped_key}'")]
    QueueOverflow { dropped_key: String },

    #[error("Signaling failure: {0}")]
    Signaling(String),

    #[error("Direct link handshake with {peer_id} failed: {reason}")]
    P2PHandshake { peer_id: String, reason: String },

    #[error("Topology degraded: {0}")]
    TopologyDegraded(String),

    #[error("Sync core failed to initialize: {0}")]
    SyncCoreInit(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Client has been destroyed")]
    Destroyed,
}

impl MeshError {
    /// Transient transport failure that the reconnect loop may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: true,
            close_code: None,
        }
    }

    /// Terminal transport failure.
    pub fn terminal(message: impl Into<String>, close_code: Option<u16>) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: false,
            close_code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            // A destroyed client is a terminal connection rejection.
            Self::Connection { .. } | Self::Destroyed => ErrorKind::Connection,
            Self::Message(_) => ErrorKind::Message,
            Self::QueueOverflow { .. } => ErrorKind::QueueOverflow,
            Self::Signaling(_) => ErrorKind::Signaling,
            Self::P2PHandshake { .. } => ErrorKind::P2PHandshake,
            Self::TopologyDegraded(_) => ErrorKind::TopologyDegraded,
            Self::SyncCoreInit(_) => ErrorKind::SyncCoreInit,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the failed operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { retryable, .. } => *retryable,
            Self::Signaling(_) | Self::P2PHandshake { .. } | Self::Storage(_) => true,
            _ => false,
        }
    }

    /// Whether this error moves the client into the terminal ERROR state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::SyncCoreInit(_) | Self::Destroyed => true,
            Self::Connection { retryable, .. } => !retryable,
            _ => false,
        }
    }
}
