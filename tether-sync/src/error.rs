//! Error types for the sync engine

use tether_store::StoreError;
use tether_types::ShapeId;
use thiserror::Error;

/// Failure reported by a transport fetch.
///
/// The engine never retries; it records the message on the affected
/// entries and moves on. Retry policy, if any, belongs to the transport.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable failure description
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        TransportError {
            message: format!("{err:#}"),
        }
    }
}

/// Errors raised by sync-backed stores
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A batch fetch failed; recorded on every key the batch covered
    #[error("fetch for shape `{shape}` failed: {message}")]
    Fetch { shape: ShapeId, message: String },

    /// The live event feed closed; the container must be recreated
    #[error("live event feed closed")]
    FeedClosed,

    /// The engine task is no longer running
    #[error("sync engine is not running")]
    EngineStopped,

    /// A resolve-once call was aborted by its signal
    #[error("resolve was aborted")]
    Aborted,

    /// Tenant routing failed before the engine was reached
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_message() {
        let err = SyncError::Fetch {
            shape: ShapeId::new("preview"),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "fetch for shape `preview` failed: boom");
    }
}
