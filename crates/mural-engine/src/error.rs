//! Error types for the engine.
//!
//! Nothing here is fatal to a session: a denied paint simply returns
//! `false`, a stale remote update is silently dropped, and a failed flush
//! is logged and forgotten. These variants exist for the few paths that
//! do surface a `Result` (resync and the runtime loop).

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The store refused or could not take a write.
    #[error("write rejected: {0}")]
    WriteRejected(#[from] crate::store::StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The realtime bus is gone; the runtime will reconnect and resync.
    #[error("realtime bus disconnected")]
    BusDisconnected,
}
