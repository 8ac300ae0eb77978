//! Blocking publish-and-confirm over an asynchronous channel
//!
//! - [`PublishBridge`] turns one confirmed publish into one blocking call
//! - [`ChannelExecutor`] is the seam through which the bridge reaches the
//!   event loop (or a test double)

pub mod publish_bridge;

pub use publish_bridge::{OperationOutcome, PublishBridge};

use crate::engine::{Deferred, Envelope};
use thiserror::Error;

/// Failure of one publish call.
///
/// Any of these means the channel is no longer usable; recovery requires a
/// fresh connect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Operation aborted.")]
    Aborted,
    #[error("Message failed to publish: {0}")]
    Lost(String),
    #[error("Publish could not be submitted: {0}")]
    Submit(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
}

/// One in-flight publish: where it goes and what it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

impl PublishRequest {
    pub fn new(
        topic: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
    ) -> Self {
        Self {
            topic: topic.into(),
            routing_key: routing_key.into(),
            envelope,
        }
    }
}

/// Issues publishes on the thread that owns the channel.
///
/// `submit` must not block on the outcome. The `confirm` handle has to be
/// resolved eventually; if submission fails it is dropped, which reports a
/// loss.
pub trait ChannelExecutor: Send + Sync {
    fn submit(&self, request: PublishRequest, confirm: Deferred) -> Result<(), PublishError>;
}
