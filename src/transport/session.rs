//! Event-loop driver for one connection
//!
//! A [`Session`] pairs the protocol engine with the transport adapter and is
//! owned by the event-loop thread for its whole life. Requests from other
//! threads arrive as [`LoopTask`] closures and run here, between socket
//! events, so the engine is never touched concurrently.

use super::adapter::{EngineOutput, ReadOutcome, TransportAdapter};
use super::state::{log_state_transition, ConnectionEvent, ConnectionState};
use super::{IoStage, TransportError};
use crate::config::ServerConfig;
use crate::engine::ProtocolEngine;
use std::future::Future;
use std::io;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Closure posted onto the event-loop thread
pub type LoopTask<E> = Box<dyn FnOnce(&mut Session<E>) + Send + 'static>;

/// How the connect phase ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Established {
    Connected,
    /// Shutdown was requested before the socket connected
    Stopped,
}

/// Engine + transport owned by the event loop
pub struct Session<E> {
    pub(crate) engine: E,
    pub(crate) transport: TransportAdapter,
    connection_id: Uuid,
    host: String,
    port: u16,
    state_tx: watch::Sender<ConnectionState>,
}

impl<E: ProtocolEngine> Session<E> {
    pub fn new(
        engine: E,
        transport: TransportAdapter,
        server: &ServerConfig,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            engine,
            transport,
            connection_id: Uuid::new_v4(),
            host: server.host.clone(),
            port: server.port,
            state_tx,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn transport(&self) -> &TransportAdapter {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Engine together with the handler its calls need
    pub fn engine_and_handler(&mut self) -> (&mut E, &mut EngineOutput) {
        (&mut self.engine, self.transport.handler_mut())
    }

    /// Split into engine and transport for ordered teardown
    pub fn into_parts(self) -> (E, TransportAdapter) {
        (self.engine, self.transport)
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = current.next(event);
        if next != current {
            log_state_transition(&current, &next);
            self.state_tx.send_replace(next);
        }
    }

    fn fail(&mut self, error: TransportError) -> TransportError {
        self.transport.close();
        self.transition(ConnectionEvent::Failure(error.to_string()));
        error
    }

    fn stop(&mut self) {
        self.transition(ConnectionEvent::CloseRequested);
        self.transport.close();
        self.transition(ConnectionEvent::SocketClosed);
    }

    /// Resolve and connect within the configured timeout.
    ///
    /// Tasks posted meanwhile run immediately; whatever they emit stays queued
    /// until the socket is attached.
    pub async fn establish(
        &mut self,
        tasks: &mut mpsc::UnboundedReceiver<LoopTask<E>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Established, TransportError> {
        let connect = TcpStream::connect((self.host.clone(), self.port));
        self.establish_with(connect, tasks, shutdown).await
    }

    /// Race `connect` against the configured timeout while running posted tasks
    pub(crate) async fn establish_with<C>(
        &mut self,
        connect: C,
        tasks: &mut mpsc::UnboundedReceiver<LoopTask<E>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Established, TransportError>
    where
        C: Future<Output = io::Result<TcpStream>>,
    {
        self.transition(ConnectionEvent::ConnectStarted);

        let timeout = self.transport.settings().connect_timeout();
        info!(
            host = %self.host,
            port = self.port,
            timeout_ms = timeout.as_millis() as u64,
            "Connecting to broker"
        );

        let connect = tokio::time::timeout(timeout, connect);
        tokio::pin!(connect);

        loop {
            if *shutdown.borrow() {
                self.stop();
                return Ok(Established::Stopped);
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.stop();
                    return Ok(Established::Stopped);
                }
                task = tasks.recv() => match task {
                    Some(task) => task(self),
                    None => {
                        self.stop();
                        return Ok(Established::Stopped);
                    }
                },
                result = &mut connect => {
                    return match result {
                        Ok(Ok(stream)) => {
                            self.transport.attach(stream);
                            self.transition(ConnectionEvent::SocketConnected);
                            Ok(Established::Connected)
                        }
                        Ok(Err(e)) => {
                            warn!(host = %self.host, port = self.port, "Connect failed: {}", e);
                            Err(self.fail(TransportError::network(IoStage::Connect, e)))
                        }
                        Err(_) => {
                            warn!(host = %self.host, port = self.port, "Connection timed out");
                            Err(self.fail(TransportError::ConnectTimeout {
                                host: self.host.clone(),
                                port: self.port,
                                timeout_ms: timeout.as_millis() as u64,
                            }))
                        }
                    };
                }
            }
        }
    }

    /// Pump bytes and run posted tasks until close, shutdown or failure.
    ///
    /// Returns `Ok(())` on a clean close or requested shutdown and the
    /// terminal failure otherwise.
    pub async fn pump(
        &mut self,
        tasks: &mut mpsc::UnboundedReceiver<LoopTask<E>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        loop {
            if let Some(failure) = self.transport.take_fatal() {
                return Err(self.fail(failure));
            }
            if self.transport.output().close_requested() {
                self.transition(ConnectionEvent::CloseRequested);
                if self.transport.should_close() {
                    self.transport.close();
                    self.transition(ConnectionEvent::SocketClosed);
                    return Ok(());
                }
            }
            if *shutdown.borrow() {
                self.stop();
                return Ok(());
            }

            let Some(socket) = self.transport.socket() else {
                self.transition(ConnectionEvent::SocketClosed);
                return Ok(());
            };
            let want_write = self.transport.wants_write();

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Shutdown requested, leaving event loop");
                    self.stop();
                    return Ok(());
                }
                task = tasks.recv() => match task {
                    Some(task) => task(self),
                    None => {
                        self.stop();
                        return Ok(());
                    }
                },
                ready = socket.writable(), if want_write => {
                    if let Err(e) = ready {
                        return Err(self.fail(TransportError::network(IoStage::Write, e)));
                    }
                    if let Err(e) = self.transport.send() {
                        return Err(self.fail(e));
                    }
                }
                ready = socket.readable() => {
                    if let Err(e) = ready {
                        return Err(self.fail(TransportError::network(IoStage::Read, e)));
                    }
                    match self.transport.receive(&mut self.engine) {
                        Ok(ReadOutcome::Eof) => {
                            self.transition(ConnectionEvent::SocketClosed);
                            return Ok(());
                        }
                        Ok(ReadOutcome::Data(_)) | Ok(ReadOutcome::WouldBlock) => {}
                        Err(e) => return Err(self.fail(e)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::engine::ConnectionHandler;
    use crate::testing::MockEngine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Harness {
        session: Session<MockEngine>,
        tasks_tx: mpsc::UnboundedSender<LoopTask<MockEngine>>,
        tasks_rx: mpsc::UnboundedReceiver<LoopTask<MockEngine>>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
        state_rx: watch::Receiver<ConnectionState>,
    }

    fn harness(port: u16, engine: MockEngine) -> Harness {
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ServerConfig::new("127.0.0.1", port);
        let transport = TransportAdapter::new(TransportSettings::default());
        Harness {
            session: Session::new(engine, transport, &server, state_tx),
            tasks_tx,
            tasks_rx,
            shutdown_tx,
            shutdown_rx,
            state_rx,
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_stage_failure() {
        let port = unused_port().await;
        let mut h = harness(port, MockEngine::new());

        let result = h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await;

        match result {
            Err(TransportError::Network { stage, .. }) => assert_eq!(stage, IoStage::Connect),
            other => panic!("expected connect failure, got {other:?}"),
        }
        assert!(matches!(*h.state_rx.borrow(), ConnectionState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_that_never_completes_times_out() {
        let mut h = harness(5672, MockEngine::new());
        let started = tokio::time::Instant::now();

        let result = h
            .session
            .establish_with(
                std::future::pending::<io::Result<TcpStream>>(),
                &mut h.tasks_rx,
                &mut h.shutdown_rx,
            )
            .await;

        match result {
            Err(TransportError::ConnectTimeout { host, port, timeout_ms }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 5672);
                assert_eq!(timeout_ms, 500);
            }
            other => panic!("expected connect timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert!(matches!(*h.state_rx.borrow(), ConnectionState::Failed(_)));
        assert!(!h.session.transport().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_while_connect_is_pending() {
        let mut h = harness(5672, MockEngine::new());
        h.tasks_tx
            .send(Box::new(|session: &mut Session<MockEngine>| {
                session.transport.handler_mut().on_data(b"EARLY");
            }))
            .unwrap();

        let result = h
            .session
            .establish_with(
                std::future::pending::<io::Result<TcpStream>>(),
                &mut h.tasks_rx,
                &mut h.shutdown_rx,
            )
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(h.session.transport().output().queue().queued_bytes(), 5);
    }

    #[tokio::test]
    async fn test_output_queued_before_connect_is_flushed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = harness(port, MockEngine::new());
        h.session.transport.handler_mut().on_data(b"HELLO");

        let established = h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        assert_eq!(established, Established::Connected);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);

        let (mut peer, _) = listener.accept().await.unwrap();
        let shutdown_tx = h.shutdown_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            let _ = shutdown_tx.send(true);
            buf
        });

        h.session.pump(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        assert_eq!(&reader.await.unwrap(), b"HELLO");
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_received_bytes_reach_engine() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = MockEngine::new().with_frame_size(3);
        let record = engine.record();
        let mut h = harness(port, engine);

        h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"abcdefg").await.unwrap();

        let shutdown_tx = h.shutdown_tx.clone();
        let watcher_record = record.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                if watcher_record.lock().unwrap().parsed.len() >= 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = shutdown_tx.send(true);
        });

        h.session.pump(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        assert_eq!(record.lock().unwrap().parsed, b"abcdef");
        assert_eq!(h.session.transport().accumulator().data(), b"g");
        drop(peer);
    }

    #[tokio::test]
    async fn test_peer_close_is_read_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = harness(port, MockEngine::new());

        h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let result = h.session.pump(&mut h.tasks_rx, &mut h.shutdown_rx).await;
        assert!(matches!(
            result,
            Err(TransportError::PeerClosed { stage: IoStage::Read })
        ));
        assert!(matches!(*h.state_rx.borrow(), ConnectionState::Failed(_)));
        assert!(h.session.transport().socket().is_none());
    }

    #[tokio::test]
    async fn test_engine_close_flushes_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = harness(port, MockEngine::new());

        h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        h.tasks_tx
            .send(Box::new(|session: &mut Session<MockEngine>| {
                let handler = session.transport.handler_mut();
                handler.on_data(b"CLOSE");
                handler.on_closed();
            }))
            .unwrap();

        h.session.pump(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Closed);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"CLOSE");
    }

    #[tokio::test]
    async fn test_engine_fatal_error_ends_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut h = harness(port, MockEngine::new().fail_on_parse("frame error"));

        h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"garbage").await.unwrap();

        let result = h.session.pump(&mut h.tasks_rx, &mut h.shutdown_rx).await;
        match result {
            Err(TransportError::Protocol(message)) => assert_eq!(message, "frame error"),
            other => panic!("expected protocol failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_connect() {
        let port = unused_port().await;
        let mut h = harness(port, MockEngine::new());
        h.shutdown_tx.send(true).unwrap();

        let result = h.session.establish(&mut h.tasks_rx, &mut h.shutdown_rx).await.unwrap();
        assert_eq!(result, Established::Stopped);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Closed);
    }
}
