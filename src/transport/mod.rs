//! Transport layer between one TCP connection and the protocol engine
//!
//! The module is split into focused sub-modules:
//!
//! - [`state`] - pure connection lifetime state machine
//! - [`adapter`] - socket ownership, input accumulation and output queueing
//! - [`session`] - the event-loop driver pairing the adapter with an engine
//!
//! Everything here runs on the event-loop thread only. Failures are never
//! retried: the socket is closed and the error is reported once, tagged with
//! the stage that produced it.

pub mod adapter;
pub mod session;
pub mod state;

pub use adapter::{EngineOutput, ReadOutcome, TransportAdapter};
pub use session::{Established, LoopTask, Session};
pub use state::{ConnectionEvent, ConnectionState};

use std::fmt;
use thiserror::Error;

/// Socket operation a network failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    Connect,
    Read,
    Write,
}

impl fmt::Display for IoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoStage::Connect => "connect",
            IoStage::Read => "read",
            IoStage::Write => "write",
        };
        f.write_str(name)
    }
}

/// Terminal transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection timed out after {timeout_ms}ms connecting to {host}:{port}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_ms: u64,
    },
    #[error("Network error (source: {stage}): {source}")]
    Network {
        stage: IoStage,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed by peer (source: {stage})")]
    PeerClosed { stage: IoStage },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Input buffer of {capacity} bytes is full and the engine consumed nothing")]
    BufferOverflow { capacity: usize },
}

impl TransportError {
    pub fn network(stage: IoStage, source: std::io::Error) -> Self {
        Self::Network { stage, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::ConnectTimeout { .. })
    }

    /// Stage of a socket failure, if this is one
    pub fn stage(&self) -> Option<IoStage> {
        match self {
            TransportError::ConnectTimeout { .. } => Some(IoStage::Connect),
            TransportError::Network { stage, .. } | TransportError::PeerClosed { stage } => {
                Some(*stage)
            }
            TransportError::Protocol(_) | TransportError::BufferOverflow { .. } => None,
        }
    }
}
