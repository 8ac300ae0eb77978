//! Byte buffers owned by the event-loop thread
//!
//! - [`accumulator`] - fixed-capacity input buffer fed to the protocol engine
//! - [`output_queue`] - FIFO of engine output awaiting the socket

pub mod accumulator;
pub mod output_queue;

pub use accumulator::ByteAccumulator;
pub use output_queue::OutputQueue;
