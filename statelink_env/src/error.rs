//! Error types for the Statelink environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
///
/// Every variant except `ContextError` is a transport failure: the
/// submission may never have reached the authority, so retrying the whole
/// command is safe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Request could not be delivered (connection closed, request dropped)
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Request was delivered but the acknowledgement was lost
    #[error("Acknowledgement lost: {0}")]
    AckLost(String),

    /// Backend is unreachable (simulated partition)
    #[error("Backend unreachable for {0}")]
    Unreachable(String),

    /// Envelope serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport failure.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(player: impl std::fmt::Display) -> Self {
        Self::Unreachable(player.to_string())
    }

    /// Returns true if resubmitting the same request is safe and useful.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ContextError(_) | Self::SerializationError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EnvError::transport("closed").is_retryable());
        assert!(EnvError::AckLost("dropped".into()).is_retryable());
        assert!(EnvError::unreachable("p1").is_retryable());
        assert!(EnvError::Timeout(500).is_retryable());
        assert!(!EnvError::SerializationError("bad".into()).is_retryable());
    }
}
