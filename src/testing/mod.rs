//! Testing utilities and mock implementations
//!
//! Everything here runs without an external broker: scriptable mocks for the
//! engine and channel seams, a loopback broker speaking a minimal confirm
//! protocol over real sockets, and an in-memory log capture.

pub mod logs;
pub mod loopback;
pub mod mocks;

pub use logs::{CapturedEvent, CapturedLogs};
pub use loopback::{
    BrokerMessage, BrokerMode, Frame, FrameKind, LoopbackBroker, LoopbackEngine, REJECT_REASON,
};
pub use mocks::*;
