//! Socket ownership and byte pumping between TCP and the protocol engine
//!
//! The adapter is the only component that touches the socket. It keeps the
//! readiness-driven I/O non-blocking (`try_read` / `try_write`) so the session
//! loop can multiplex reads, writes and posted tasks on one thread.

use super::{IoStage, TransportError};
use crate::buffer::{ByteAccumulator, OutputQueue};
use crate::config::TransportSettings;
use crate::engine::{ConnectionHandler, ProtocolEngine};
use bytes::Bytes;
use std::io;
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

/// Result of one non-blocking read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were received and fed to the engine
    Data(usize),
    /// Readiness was spurious
    WouldBlock,
    /// Peer closed after we asked to close
    Eof,
}

/// Engine-facing side of the transport: receives output and lifecycle callbacks
#[derive(Debug, Default)]
pub struct EngineOutput {
    queue: OutputQueue,
    is_connected: bool,
    should_quit: bool,
    fatal: Option<String>,
    emitted_bytes: u64,
}

impl EngineOutput {
    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    /// A write is in flight whenever there is output and a socket to send it on
    pub fn is_writing(&self) -> bool {
        self.is_connected && !self.queue.is_empty()
    }

    pub fn close_requested(&self) -> bool {
        self.should_quit
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Total bytes the engine has emitted
    pub fn emitted_bytes(&self) -> u64 {
        self.emitted_bytes
    }
}

impl ConnectionHandler for EngineOutput {
    fn on_data(&mut self, data: &[u8]) {
        trace!(bytes = data.len(), queued = self.queue.len(), "Engine emitted bytes");
        self.emitted_bytes += data.len() as u64;
        self.queue.push(Bytes::copy_from_slice(data));
    }

    fn on_error(&mut self, message: &str) {
        error!("Protocol engine error: {}", message);
        // First error wins; later ones are consequences
        if self.fatal.is_none() {
            self.fatal = Some(message.to_string());
        }
    }

    fn on_closed(&mut self) {
        debug!(pending_chunks = self.queue.len(), "Protocol engine closed connection");
        self.should_quit = true;
    }
}

/// Bidirectional byte pump for one broker connection
#[derive(Debug)]
pub struct TransportAdapter {
    settings: TransportSettings,
    accumulator: ByteAccumulator,
    scratch: Vec<u8>,
    output: EngineOutput,
    socket: Option<TcpStream>,
}

impl TransportAdapter {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            accumulator: ByteAccumulator::new(settings.accumulator_capacity),
            scratch: vec![0u8; settings.read_buffer_size],
            output: EngineOutput::default(),
            socket: None,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Handler to pass into engine calls
    pub fn handler_mut(&mut self) -> &mut EngineOutput {
        &mut self.output
    }

    pub fn output(&self) -> &EngineOutput {
        &self.output
    }

    pub fn accumulator(&self) -> &ByteAccumulator {
        &self.accumulator
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.output.is_connected
    }

    /// Take ownership of a freshly connected socket
    pub fn attach(&mut self, socket: TcpStream) {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        self.socket = Some(socket);
        self.output.is_connected = true;
        debug!(
            queued_chunks = self.output.queue.len(),
            "Socket attached, flushing output queued before connect"
        );
    }

    /// Whether the write side has something to send
    pub fn wants_write(&self) -> bool {
        self.output.is_writing()
    }

    /// Close was requested and every queued chunk has been written
    pub fn should_close(&self) -> bool {
        self.output.should_quit && self.output.queue.is_empty()
    }

    /// Fatal engine error reported since the last call
    pub fn take_fatal(&mut self) -> Option<TransportError> {
        self.output.fatal.take().map(TransportError::Protocol)
    }

    /// Drop the socket, closing it
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Socket closed");
        }
        self.output.is_connected = false;
    }

    /// Read whatever the socket has and feed it to the engine
    pub fn receive<E: ProtocolEngine>(
        &mut self,
        engine: &mut E,
    ) -> Result<ReadOutcome, TransportError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(ReadOutcome::Eof);
        };

        match socket.try_read(&mut self.scratch) {
            Ok(0) => {
                self.close();
                if self.output.should_quit {
                    Ok(ReadOutcome::Eof)
                } else {
                    Err(TransportError::PeerClosed {
                        stage: IoStage::Read,
                    })
                }
            }
            Ok(length) => {
                trace!(bytes = length, "Received bytes");
                feed_engine(
                    &mut self.accumulator,
                    &mut self.output,
                    engine,
                    &self.scratch[..length],
                )?;
                Ok(ReadOutcome::Data(length))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => {
                self.close();
                Err(TransportError::network(IoStage::Read, e))
            }
        }
    }

    /// Write as much of the front chunk as the socket accepts
    pub fn send(&mut self) -> Result<usize, TransportError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(0);
        };

        match socket.try_write(self.output.queue.front()) {
            Ok(written) => {
                let popped = self.output.queue.advance(written);
                trace!(bytes = written, chunk_done = popped, "Wrote bytes");
                Ok(written)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.close();
                Err(TransportError::network(IoStage::Write, e))
            }
        }
    }

    /// Feed bytes to the engine as if they had been read from the socket
    pub fn ingest<E: ProtocolEngine>(
        &mut self,
        engine: &mut E,
        data: &[u8],
    ) -> Result<(), TransportError> {
        feed_engine(&mut self.accumulator, &mut self.output, engine, data)
    }
}

/// Append `data` to the accumulator and let the engine consume it.
///
/// Input larger than the free space is fed in pieces. A full accumulator the
/// engine cannot make progress on is an overflow, never a silent drop.
fn feed_engine<E: ProtocolEngine>(
    accumulator: &mut ByteAccumulator,
    output: &mut EngineOutput,
    engine: &mut E,
    mut data: &[u8],
) -> Result<(), TransportError> {
    loop {
        let written = accumulator.write(data);
        data = &data[written..];

        let available = accumulator.available();
        let consumed = if available > 0 {
            engine.parse(accumulator.data(), output)
        } else {
            0
        };

        if consumed > available {
            return Err(TransportError::Protocol(format!(
                "engine consumed {consumed} bytes but only {available} were buffered"
            )));
        }
        if consumed == available {
            accumulator.drain();
        } else if consumed > 0 {
            accumulator.shift(consumed);
        }

        if data.is_empty() || output.fatal.is_some() {
            return Ok(());
        }
        if written == 0 && consumed == 0 {
            return Err(TransportError::BufferOverflow {
                capacity: accumulator.capacity(),
            });
        }
    }
}
