//! AMQP Streamer - blocking publish-and-confirm over an event-loop driven connection
//!
//! A producer thread calls [`Streamer::publish`] and gets back only once the
//! broker has confirmed or rejected the message. The socket, the buffers and
//! the protocol engine all live on one background event-loop thread; the only
//! state shared with callers is the publish bridge's outcome slot.
//!
//! # Overview
//!
//! - [`buffer`] - fixed-capacity input accumulator and the output queue
//! - [`engine`] - the contract a wire-protocol engine implements
//! - [`transport`] - socket ownership and the event-loop session driver
//! - [`bridge`] - turns asynchronous confirmations into a blocking call
//! - [`streamer`] - connection and thread lifecycle
//! - [`testing`] - mocks and an in-process loopback broker
//!
//! # Quick Start
//!
//! ```no_run
//! use amqp_streamer::testing::LoopbackEngine;
//! use amqp_streamer::{ServerConfig, Streamer, TransportSettings};
//!
//! let streamer = Streamer::new(
//!     ServerConfig::new("127.0.0.1", 5672).with_credentials("guest", "guest"),
//!     TransportSettings::default(),
//!     LoopbackEngine::factory(),
//!     |error| eprintln!("connection failed: {error}"),
//! );
//!
//! streamer.connect()?;
//! streamer.publish("orders", "po=test", "order.v1", vec![0u8; 500])?;
//! streamer.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod streamer;
pub mod testing;
pub mod transport;

pub use bridge::{ChannelExecutor, OperationOutcome, PublishBridge, PublishError, PublishRequest};
pub use buffer::{ByteAccumulator, OutputQueue};
pub use config::{ConfigError, ServerConfig, StreamerConfig, TransportSettings};
pub use engine::{
    ChannelId, ConnectionHandler, Deferred, EngineError, EngineFactory, Envelope, ProtocolEngine,
};
pub use error::{StreamerError, StreamerResult};
pub use streamer::{ErrorCallback, Streamer};
pub use transport::{ConnectionState, IoStage, TransportError};
