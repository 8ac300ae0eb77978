//! Confirmation handle for one publish
//!
//! The engine resolves a [`Deferred`] exactly once: acknowledged by the broker
//! or lost. Dropping it unresolved counts as a loss, so tearing the engine down
//! with confirmations outstanding still wakes whoever is waiting on them.

use std::fmt;

type AckCallback = Box<dyn FnOnce() + Send + 'static>;
type LostCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Reason reported when a confirmation is dropped without being resolved
pub const DROPPED_REASON: &str = "confirmation dropped before the broker answered";

/// Acknowledgment/loss registration for a publish with confirmation
#[derive(Default)]
pub struct Deferred {
    on_ack: Option<AckCallback>,
    on_lost: Option<LostCallback>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler run when the broker confirms the message
    pub fn on_ack(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_ack = Some(Box::new(callback));
        self
    }

    /// Register the handler run when the message will not be delivered
    pub fn on_lost(mut self, callback: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_lost = Some(Box::new(callback));
        self
    }

    /// Resolve as acknowledged
    pub fn acknowledge(mut self) {
        self.on_lost = None;
        if let Some(callback) = self.on_ack.take() {
            callback();
        }
    }

    /// Resolve as lost with a reason
    pub fn lose(mut self, reason: impl Into<String>) {
        self.on_ack = None;
        if let Some(callback) = self.on_lost.take() {
            callback(reason.into());
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        if let Some(callback) = self.on_lost.take() {
            callback(DROPPED_REASON.to_string());
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("on_ack", &self.on_ack.is_some())
            .field("on_lost", &self.on_lost.is_some())
            .finish()
    }
}
