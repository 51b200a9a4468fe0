//! Error types surfaced to callers of the channel client and server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by channel client operations.
///
/// Every variant renders as a human-readable message; provider failures carry
/// the server-supplied text verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    /// `prompt_streaming` was called without an active session. Raised locally,
    /// the server is never contacted.
    #[error("No active session. Create a session before prompting.")]
    NoActiveSession,
    /// The model provider rejected the operation (download, create, stream).
    #[error("{0}")]
    Provider(String),
    /// The transport could not be opened or written to.
    #[error("Channel error: {0}")]
    Channel(String),
    /// The peer went away while the call was pending.
    #[error("Channel closed before the operation completed")]
    ChannelClosed,
    /// The operation was superseded by a newer one or torn down by `destroy_session`.
    #[error("Operation aborted")]
    Aborted,
    /// A message could not be encoded or did not match the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::NoActiveSession | BridgeError::ChannelClosed | BridgeError::Aborted
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_raw_message() {
        let err = BridgeError::Provider("Model download failed: disk full".to_string());
        assert_eq!(err.to_string(), "Model download failed: disk full");
    }

    #[test]
    fn recoverable_classification() {
        assert!(BridgeError::NoActiveSession.is_recoverable());
        assert!(BridgeError::Aborted.is_recoverable());
        assert!(!BridgeError::Provider("boom".into()).is_recoverable());
        assert!(!BridgeError::Protocol("bad".into()).is_recoverable());
    }
}
