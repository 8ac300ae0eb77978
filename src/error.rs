//! Crate-level error type
//!
//! Each layer has its own error enum; [`StreamerError`] is what the
//! orchestrator returns from `connect()` and hands to the error callback.

use crate::bridge::PublishError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for connection setup and background failures
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Failed to start event loop: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Event loop thread panicked")]
    EventLoopPanicked,
}

impl StreamerError {
    /// Whether this is a connect timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamerError::Transport(e) if e.is_timeout())
    }
}

/// Result type for streamer operations
pub type StreamerResult<T> = Result<T, StreamerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::IoStage;

    #[test]
    fn test_transport_errors_keep_their_message() {
        let error: StreamerError = TransportError::PeerClosed {
            stage: IoStage::Read,
        }
        .into();
        assert_eq!(
            error.to_string(),
            "Transport error: Connection closed by peer (source: read)"
        );
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_timeout_detection() {
        let error = StreamerError::from(TransportError::ConnectTimeout {
            host: "10.255.255.1".to_string(),
            port: 5672,
            timeout_ms: 500,
        });
        assert!(error.is_timeout());
        assert!(!StreamerError::EventLoopPanicked.is_timeout());
    }

    #[test]
    fn test_publish_error_conversion() {
        let error = StreamerError::from(PublishError::Aborted);
        assert_eq!(error.to_string(), "Publish error: Operation aborted.");
    }
}
