//! Error types for the test plan environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
///
/// Every collaborator trait (sync service, transport, dataset engine)
/// reports through this type so the coordinator can tell a dead sync
/// service apart from a single unreachable peer.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Network send or dial failed
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target peer is unreachable (simulated partition, unknown address)
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The synchronization service is gone; fatal for the run
    #[error("Sync service unavailable: {0}")]
    ServiceUnavailable(String),

    /// This node's sync client handle has already been closed
    #[error("Sync client closed")]
    ClientClosed,

    /// A topic subscription stream ended before the caller was done with it
    #[error("Subscription to {0:?} ended")]
    SubscriptionClosed(String),

    /// Dataset engine failure (save, push, pull, logbook)
    #[error("Dataset error: {0}")]
    DatasetError(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(peer: impl std::fmt::Display) -> Self {
        Self::PeerUnreachable(peer.to_string())
    }

    /// Creates a dataset error.
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::DatasetError(msg.into())
    }

    /// Returns true if this error means the sync service itself failed.
    ///
    /// These are never retried by the coordination layer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnvError::ServiceUnavailable(_) | EnvError::ClientClosed | EnvError::SubscriptionClosed(_)
        )
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
