//! Loopback broker and a matching protocol engine
//!
//! Both sides speak a minimal confirm protocol so the whole stack can run
//! against a real socket without an external broker. Frames are
//! `kind: u8, sequence: u64, body_len: u32, body` in network byte order.
//!
//! The client opens with `Open` (vhost and user), declares channels with
//! `ChannelOpen` and sends `Publish` frames whose sequence is the delivery
//! tag. The broker answers `OpenOk`, then `Ack` or `Nack` per delivery tag.
//! Either side may send `Close`; the other replies with `Close` and drops the
//! socket.

use crate::config::ServerConfig;
use crate::engine::{
    ChannelId, ConnectionHandler, Deferred, EngineError, EngineFactory, Envelope, ProtocolEngine,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const FRAME_HEADER_LEN: usize = 13;

/// Largest body either side accepts
pub const MAX_FRAME_BODY: usize = 64 * 1024;

pub const REJECT_REASON: &str = "message rejected by broker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Open = 1,
    OpenOk = 2,
    ChannelOpen = 3,
    Publish = 4,
    Ack = 5,
    Nack = 6,
    Close = 7,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameKind::Open,
            2 => FrameKind::OpenOk,
            3 => FrameKind::ChannelOpen,
            4 => FrameKind::Publish,
            5 => FrameKind::Ack,
            6 => FrameKind::Nack,
            7 => FrameKind::Close,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, sequence: u64, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            sequence,
            body: body.into(),
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(FRAME_HEADER_LEN + self.body.len());
        out.put_u8(self.kind as u8);
        out.put_u64(self.sequence);
        out.put_u32(self.body.len() as u32);
        out.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    /// Decode the frame at the front of `input`.
    ///
    /// Returns the frame and the bytes it occupied, or `None` while it is
    /// still incomplete.
    pub fn decode(input: &[u8]) -> Result<Option<(Frame, usize)>, String> {
        if input.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = &input[..FRAME_HEADER_LEN];
        let kind_byte = header.get_u8();
        let sequence = header.get_u64();
        let body_len = header.get_u32() as usize;

        let kind =
            FrameKind::from_u8(kind_byte).ok_or_else(|| format!("unknown frame kind {kind_byte}"))?;
        if body_len > MAX_FRAME_BODY {
            return Err(format!(
                "frame body of {body_len} bytes exceeds the {MAX_FRAME_BODY} byte limit"
            ));
        }

        let total = FRAME_HEADER_LEN + body_len;
        if input.len() < total {
            return Ok(None);
        }
        let body = Bytes::copy_from_slice(&input[FRAME_HEADER_LEN..total]);
        Ok(Some((Frame::new(kind, sequence, body), total)))
    }
}

/// A message as the broker received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub routing_key: String,
    pub message_type: Option<String>,
    pub payload: Bytes,
}

fn put_short_str(out: &mut BytesMut, value: &str) {
    let len = value.len().min(u16::MAX as usize);
    out.put_u16(len as u16);
    out.put_slice(&value.as_bytes()[..len]);
}

fn get_short_str(body: &mut Bytes) -> Result<String, String> {
    if body.remaining() < 2 {
        return Err("truncated publish body".to_string());
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err("truncated publish body".to_string());
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| format!("invalid utf-8 in publish body: {e}"))
}

fn encode_publish(topic: &str, routing_key: &str, envelope: &Envelope) -> Bytes {
    let mut out = BytesMut::with_capacity(envelope.len() + topic.len() + routing_key.len() + 16);
    put_short_str(&mut out, topic);
    put_short_str(&mut out, routing_key);
    put_short_str(&mut out, envelope.message_type().unwrap_or_default());
    out.put_slice(&envelope.payload);
    out.freeze()
}

impl BrokerMessage {
    fn decode(mut body: Bytes) -> Result<Self, String> {
        let topic = get_short_str(&mut body)?;
        let routing_key = get_short_str(&mut body)?;
        let message_type = get_short_str(&mut body)?;
        Ok(Self {
            topic,
            routing_key,
            message_type: (!message_type.is_empty()).then_some(message_type),
            payload: body,
        })
    }
}

/// Client side of the loopback protocol
#[derive(Debug)]
pub struct LoopbackEngine {
    handshake_done: bool,
    closed: bool,
    channels: Vec<ChannelId>,
    next_delivery_tag: u64,
    pending: BTreeMap<u64, Deferred>,
}

impl LoopbackEngine {
    /// Queue the opening handshake and return the engine
    pub fn connect(
        server: &ServerConfig,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<Self, EngineError> {
        let greeting = format!("{}\0{}", server.vhost, server.username);
        emit(handler, &Frame::new(FrameKind::Open, 0, greeting));
        Ok(Self {
            handshake_done: false,
            closed: false,
            channels: Vec::new(),
            next_delivery_tag: 0,
            pending: BTreeMap::new(),
        })
    }

    pub fn factory() -> EngineFactory<Self> {
        Box::new(|server, handler| LoopbackEngine::connect(server, handler))
    }

    pub fn is_open(&self) -> bool {
        self.handshake_done && !self.closed
    }

    pub fn pending_confirms(&self) -> usize {
        self.pending.len()
    }

    fn lose_pending(&mut self, reason: &str) {
        for (_, confirm) in std::mem::take(&mut self.pending) {
            confirm.lose(reason);
        }
    }

    fn handle(&mut self, frame: Frame, handler: &mut dyn ConnectionHandler) {
        match frame.kind {
            FrameKind::OpenOk => {
                debug!("Loopback handshake complete");
                self.handshake_done = true;
            }
            FrameKind::Ack => match self.pending.remove(&frame.sequence) {
                Some(confirm) => confirm.acknowledge(),
                None => handler.on_error(&format!(
                    "ack for unknown delivery tag {}",
                    frame.sequence
                )),
            },
            FrameKind::Nack => match self.pending.remove(&frame.sequence) {
                Some(confirm) => confirm.lose(String::from_utf8_lossy(&frame.body)),
                None => handler.on_error(&format!(
                    "nack for unknown delivery tag {}",
                    frame.sequence
                )),
            },
            FrameKind::Close => {
                let reason = String::from_utf8_lossy(&frame.body).into_owned();
                info!(reason = %reason, "Broker closed the connection");
                self.closed = true;
                self.lose_pending(&format!("connection closed by broker: {reason}"));
                emit(handler, &Frame::new(FrameKind::Close, 0, Bytes::new()));
                handler.on_closed();
            }
            kind => handler.on_error(&format!("unexpected {kind:?} frame from broker")),
        }
    }
}

fn emit(handler: &mut dyn ConnectionHandler, frame: &Frame) {
    handler.on_data(&frame.to_bytes());
}

impl ProtocolEngine for LoopbackEngine {
    fn parse(&mut self, input: &[u8], handler: &mut dyn ConnectionHandler) -> usize {
        let mut consumed = 0;
        while !self.closed {
            match Frame::decode(&input[consumed..]) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    self.handle(frame, handler);
                }
                Ok(None) => return consumed,
                Err(message) => {
                    self.closed = true;
                    self.lose_pending(&message);
                    handler.on_error(&message);
                    break;
                }
            }
        }
        // Nothing after a close is meaningful
        input.len()
    }

    fn open_channel(
        &mut self,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<ChannelId, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        let channel = self.channels.len() as ChannelId + 1;
        self.channels.push(channel);
        emit(
            handler,
            &Frame::new(FrameKind::ChannelOpen, u64::from(channel), Bytes::new()),
        );
        Ok(channel)
    }

    fn publish(
        &mut self,
        channel: ChannelId,
        topic: &str,
        routing_key: &str,
        envelope: &Envelope,
        confirm: Deferred,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<(), EngineError> {
        let refused = if self.closed {
            Some(EngineError::Closed)
        } else if !self.channels.contains(&channel) {
            Some(EngineError::ChannelUnavailable(channel))
        } else {
            None
        };
        if let Some(error) = refused {
            confirm.lose(error.to_string());
            return Err(error);
        }

        self.next_delivery_tag += 1;
        let tag = self.next_delivery_tag;
        let body = encode_publish(topic, routing_key, envelope);
        emit(handler, &Frame::new(FrameKind::Publish, tag, body));
        self.pending.insert(tag, confirm);
        Ok(())
    }
}

/// How the loopback broker answers publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// Acknowledge every message
    Ack,
    /// Negatively acknowledge every message
    Reject,
    /// Never answer publishes
    Silent,
    /// Acknowledge `n` messages per connection, then drop it without a word
    DropAfter(u64),
    /// Acknowledge `n` messages per connection, then close it gracefully
    CloseAfter(u64),
}

#[derive(Debug, Default)]
struct BrokerStats {
    connections: AtomicU64,
    received: AtomicU64,
    last_message: Mutex<Option<BrokerMessage>>,
}

/// In-process broker listening on an ephemeral localhost port.
///
/// Runs on its own thread and stops when dropped.
#[derive(Debug)]
pub struct LoopbackBroker {
    addr: SocketAddr,
    stats: Arc<BrokerStats>,
    shutdown: Option<watch::Sender<bool>>,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackBroker {
    pub fn start(mode: BrokerMode) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(BrokerStats::default());
        let broker_stats = Arc::clone(&stats);

        let thread = thread::Builder::new()
            .name("loopback-broker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => serve(listener, mode, broker_stats, shutdown_rx).await,
                        Err(e) => warn!("Loopback broker could not register listener: {}", e),
                    }
                });
            })?;

        info!(%addr, ?mode, "Loopback broker listening");
        Ok(Self {
            addr,
            stats,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connection settings pointing at this broker
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Publishes received across all connections
    pub fn received(&self) -> u64 {
        self.stats.received.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u64 {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn last_message(&self) -> Option<BrokerMessage> {
        self.stats
            .last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop accepting, drop every connection and join the broker thread
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Loopback broker thread panicked");
            }
        }
    }
}

impl Drop for LoopbackBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    listener: TcpListener,
    mode: BrokerMode,
    stats: Arc<BrokerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    debug!(%peer, "Loopback broker accepted connection");
                    let stats = Arc::clone(&stats);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, mode, stats, shutdown).await {
                            debug!(%peer, "Loopback connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Loopback broker accept failed: {}", e),
            }
        }
    }
    connections.abort_all();
}

enum Reply {
    Frame(Frame),
    Nothing,
    Hangup,
}

/// Per-connection broker state
#[derive(Debug, Default)]
struct ConnectionTally {
    /// Publishes received on this connection; mode limits apply to it
    received: u64,
    closing: bool,
}

fn respond(frame: Frame, mode: BrokerMode, stats: &BrokerStats, tally: &mut ConnectionTally) -> Reply {
    match frame.kind {
        FrameKind::Open => Reply::Frame(Frame::new(FrameKind::OpenOk, 0, Bytes::new())),
        FrameKind::ChannelOpen => Reply::Nothing,
        FrameKind::Close => Reply::Hangup,
        FrameKind::Publish if tally.closing => Reply::Nothing,
        FrameKind::Publish => {
            stats.received.fetch_add(1, Ordering::SeqCst);
            tally.received += 1;
            let count = tally.received;
            match BrokerMessage::decode(frame.body) {
                Ok(message) => {
                    *stats
                        .last_message
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(message);
                }
                Err(e) => {
                    warn!("Loopback broker received malformed publish: {}", e);
                    return Reply::Hangup;
                }
            }

            let ack = Frame::new(FrameKind::Ack, frame.sequence, Bytes::new());
            match mode {
                BrokerMode::Ack => Reply::Frame(ack),
                BrokerMode::Reject => {
                    Reply::Frame(Frame::new(FrameKind::Nack, frame.sequence, REJECT_REASON))
                }
                BrokerMode::Silent => Reply::Nothing,
                BrokerMode::DropAfter(limit) if count > limit => Reply::Hangup,
                BrokerMode::CloseAfter(limit) if count > limit => {
                    tally.closing = true;
                    Reply::Frame(Frame::new(
                        FrameKind::Close,
                        0,
                        format!("closing after {limit} messages"),
                    ))
                }
                BrokerMode::DropAfter(_) | BrokerMode::CloseAfter(_) => Reply::Frame(ack),
            }
        }
        kind => {
            warn!(?kind, "Unexpected frame from client");
            Reply::Hangup
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    mode: BrokerMode,
    stats: Arc<BrokerStats>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let mut inbound = BytesMut::with_capacity(16 * 1024);
    let mut outbound = BytesMut::new();
    let mut tally = ConnectionTally::default();

    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = socket.read_buf(&mut inbound) => read?,
        };
        if read == 0 {
            return Ok(());
        }

        loop {
            let (frame, used) = match Frame::decode(&inbound) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(message) => {
                    warn!("Loopback broker received bad frame: {}", message);
                    return Ok(());
                }
            };
            inbound.advance(used);

            match respond(frame, mode, &stats, &mut tally) {
                Reply::Frame(reply) => reply.encode(&mut outbound),
                Reply::Nothing => {}
                Reply::Hangup => return Ok(()),
            }
        }

        if !outbound.is_empty() {
            socket.write_all(&outbound).await?;
            outbound.clear();
        }
    }
}
