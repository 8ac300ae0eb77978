//! Protocol-engine collaborator contract
//!
//! The broker's wire protocol (framing, handshake, channel semantics) lives
//! behind [`ProtocolEngine`]. The rest of the crate only relies on four
//! things from it:
//!
//! 1. a byte-stream parse entry point that reports how much input it consumed,
//! 2. byte output delivered through [`ConnectionHandler::on_data`],
//! 3. lifecycle callbacks for fatal errors and close,
//! 4. a publish operation whose outcome arrives later through a [`Deferred`].
//!
//! Engines are driven exclusively from the event-loop thread. Every call
//! receives the handler explicitly instead of the engine keeping a pointer
//! back into the transport.

pub mod deferred;
pub mod envelope;

pub use deferred::Deferred;
pub use envelope::{Envelope, DEFAULT_CONTENT_TYPE, MESSAGE_TYPE_HEADER};

use crate::config::ServerConfig;
use thiserror::Error;

/// Logical sub-connection identifier
pub type ChannelId = u16;

/// Errors raised synchronously by an engine call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Channel {0} is not usable")]
    ChannelUnavailable(ChannelId),
    #[error("Connection is closed")]
    Closed,
}

/// Output and lifecycle callbacks the engine invokes
pub trait ConnectionHandler {
    /// The engine has bytes to send to the broker
    fn on_data(&mut self, data: &[u8]);

    /// The engine hit an unrecoverable protocol error
    fn on_error(&mut self, message: &str);

    /// The engine finished closing the connection
    fn on_closed(&mut self);
}

/// Broker protocol state machine driven by the transport
pub trait ProtocolEngine: Send + 'static {
    /// Consume buffered input, returning how many bytes were used.
    ///
    /// Bytes past the returned count are kept and offered again, prefixed to
    /// the next read.
    fn parse(&mut self, input: &[u8], handler: &mut dyn ConnectionHandler) -> usize;

    /// Open a channel for publishing
    fn open_channel(
        &mut self,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<ChannelId, EngineError>;

    /// Publish with confirmation; `confirm` is resolved once the broker answers.
    ///
    /// When the publish is refused synchronously, `confirm` is lost with the
    /// error's reason before the error is returned.
    fn publish(
        &mut self,
        channel: ChannelId,
        topic: &str,
        routing_key: &str,
        envelope: &Envelope,
        confirm: Deferred,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<(), EngineError>;
}

/// Builds an engine for one connection.
///
/// Invoked once per `connect()`, on the caller thread, before the event loop
/// starts. Handshake bytes written to `handler` are queued until the socket
/// is connected.
pub type EngineFactory<E> =
    Box<dyn Fn(&ServerConfig, &mut dyn ConnectionHandler) -> Result<E, EngineError> + Send + Sync>;
