//! Connection orchestrator
//!
//! [`Streamer`] owns one broker connection end to end: the event-loop runtime,
//! the background thread driving it, the transport, the protocol engine and
//! the publish bridge. Everything except `publish` is serialised by an
//! internal mutex; `publish` only holds it long enough to grab the current
//! bridge, so `stop()` from another thread can abort a blocked publish.
//!
//! # Lifecycle
//!
//! `connect()` builds the pieces in order (event loop, transport, engine,
//! channel, bridge), starts the `amqp-event-loop` thread and waits for the TCP
//! connect outcome. A connect failure or timeout is returned from `connect()`.
//! Anything that goes wrong afterwards is handed to the error callback and
//! fails the bridge so no publish is left waiting.
//!
//! `stop()` (also run on drop) signals the loop, joins the thread and then
//! drops bridge, engine, transport and event loop in that order.
//!
//! A publish issued while the event loop is alive but silent blocks until
//! the broker answers or `stop()` is called. There is no implicit timeout.
//!
//! `connect()` and `stop()` block and must not be called from inside an async
//! runtime.

pub mod event_loop;

pub use event_loop::{EventLoop, LoopChannel, LoopClosed, LoopHandle, EVENT_LOOP_THREAD};

use crate::bridge::{PublishBridge, PublishError, PublishRequest};
use crate::config::{ServerConfig, StreamerConfig, TransportSettings};
use crate::engine::{EngineFactory, Envelope, ProtocolEngine};
use crate::error::{StreamerError, StreamerResult};
use crate::transport::{
    ConnectionState, Established, LoopTask, Session, TransportAdapter, TransportError,
};
use bytes::Bytes;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Dispatch};
use uuid::Uuid;

/// Receives failures that happen on the event-loop thread after connect.
///
/// Runs on the event-loop thread. Calling [`Streamer::stop`] or
/// [`Streamer::connect`] from it detaches the failed loop thread instead of
/// joining it; the thread then drops its own engine, transport and runtime.
pub type ErrorCallback = Arc<dyn Fn(StreamerError) + Send + Sync>;

type Bridge<E> = PublishBridge<LoopChannel<E>>;

/// What the event-loop thread hands back for ordered teardown
type LoopRemains<E> = (EventLoop, Session<E>);

struct Running<E> {
    connection_id: Uuid,
    bridge: Arc<Bridge<E>>,
    handle: LoopHandle<E>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    thread: JoinHandle<LoopRemains<E>>,
}

/// Blocking publish-and-confirm client for one broker connection
pub struct Streamer<E: ProtocolEngine> {
    server: ServerConfig,
    settings: TransportSettings,
    factory: EngineFactory<E>,
    on_error: ErrorCallback,
    running: Mutex<Option<Running<E>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: ProtocolEngine> Streamer<E> {
    pub fn new(
        server: ServerConfig,
        settings: TransportSettings,
        factory: EngineFactory<E>,
        on_error: impl Fn(StreamerError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            server,
            settings,
            factory,
            on_error: Arc::new(on_error),
            running: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: StreamerConfig,
        factory: EngineFactory<E>,
        on_error: impl Fn(StreamerError) + Send + Sync + 'static,
    ) -> Self {
        Self::new(config.server, config.transport, factory, on_error)
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// (Re)connect: tear down any previous connection, then build a new one.
    ///
    /// Returns once the socket is connected, or with the setup failure.
    pub fn connect(&self) -> StreamerResult<()> {
        let mut running = lock(&self.running);
        if let Some(previous) = running.take() {
            debug!(connection_id = %previous.connection_id, "Replacing existing connection");
            if let Err(e) = teardown(previous) {
                warn!("Previous connection ended badly: {}", e);
            }
        }

        self.server.validate()?;
        self.settings.validate()?;

        let event_loop = EventLoop::new().map_err(StreamerError::Runtime)?;
        let mut transport = TransportAdapter::new(self.settings);
        let mut engine = (self.factory)(&self.server, transport.handler_mut())?;
        let channel = engine.open_channel(transport.handler_mut())?;

        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel::<LoopTask<E>>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);

        let session = Session::new(engine, transport, &self.server, state_tx);
        let connection_id = session.connection_id();
        let handle = LoopHandle::new(tasks_tx);
        let bridge = Arc::new(PublishBridge::new(LoopChannel::new(channel, handle.clone())));

        let (connected_tx, connected_rx) = std_mpsc::sync_channel(1);
        let worker = EventLoopWorker {
            event_loop,
            session,
            tasks: tasks_rx,
            shutdown: shutdown_rx,
            connected: connected_tx,
            bridge: Arc::clone(&bridge),
            on_error: Arc::clone(&self.on_error),
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        };
        let thread = thread::Builder::new()
            .name(EVENT_LOOP_THREAD.to_string())
            .spawn(move || worker.run())
            .map_err(StreamerError::Runtime)?;

        let started = Running {
            connection_id,
            bridge,
            handle,
            shutdown: shutdown_tx,
            state: state_rx,
            thread,
        };

        match connected_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    %connection_id,
                    host = %self.server.host,
                    port = self.server.port,
                    channel,
                    "Connected to broker"
                );
                *running = Some(started);
                Ok(())
            }
            Ok(Err(e)) => {
                teardown(started)?;
                Err(e.into())
            }
            Err(_) => {
                // The thread ended without reporting; only a panic gets here
                teardown(started)?;
                Err(StreamerError::EventLoopPanicked)
            }
        }
    }

    /// Publish `payload` tagged with `message_type` and block until confirmed
    pub fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        message_type: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), PublishError> {
        let envelope = Envelope::new(payload).with_message_type(message_type);
        self.publish_envelope(topic, routing_key, envelope)
    }

    /// Publish a prepared envelope and block until confirmed
    pub fn publish_envelope(
        &self,
        topic: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), PublishError> {
        let bridge = lock(&self.running)
            .as_ref()
            .map(|running| Arc::clone(&running.bridge))
            .ok_or(PublishError::NotConnected)?;

        let span = crate::publish_span!(topic = %topic, routing_key = %routing_key);
        let _entered = span.enter();
        bridge.publish(PublishRequest::new(topic, routing_key, envelope))
    }

    /// Stop the event loop, join its thread and release the connection.
    ///
    /// Any blocked publish fails with [`PublishError::Aborted`]. Calling it
    /// when not connected does nothing.
    pub fn stop(&self) {
        // Abort blocked publishers before waiting on the lock they may not need
        if let Some(bridge) = self.current_bridge() {
            bridge.stop();
        }

        let Some(running) = lock(&self.running).take() else {
            return;
        };
        let connection_id = running.connection_id;
        match teardown(running) {
            Ok(()) => info!(%connection_id, "Streamer stopped"),
            Err(e) => error!(%connection_id, "Streamer stopped after failure: {}", e),
        }
    }

    fn current_bridge(&self) -> Option<Arc<Bridge<E>>> {
        lock(&self.running)
            .as_ref()
            .map(|running| Arc::clone(&running.bridge))
    }

    /// Run `probe` against the live session on the event-loop thread.
    ///
    /// Returns `None` when no event loop is running.
    pub fn inspect<R, F>(&self, probe: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&Session<E>) -> R + Send + 'static,
    {
        let handle = lock(&self.running).as_ref().map(|running| running.handle.clone())?;
        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        handle
            .post(move |session| {
                let _ = result_tx.send(probe(session));
            })
            .ok()?;
        result_rx.recv().ok()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.running)
            .as_ref()
            .map(|running| running.state.borrow().clone())
            .unwrap_or(ConnectionState::NotConnected)
    }

    /// Whether the event-loop thread is still driving a connection
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|running| !running.thread.is_finished())
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        lock(&self.running).as_ref().map(|running| running.connection_id)
    }

    /// Sticky failure of the current channel, if any
    pub fn failure(&self) -> Option<PublishError> {
        self.current_bridge().and_then(|bridge| bridge.failure())
    }
}

impl<E: ProtocolEngine> Drop for Streamer<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join the loop thread, then drop bridge, engine, transport, event loop
fn teardown<E: ProtocolEngine>(running: Running<E>) -> StreamerResult<()> {
    let Running {
        connection_id,
        bridge,
        handle: _,
        shutdown,
        state: _,
        thread,
    } = running;

    bridge.stop();
    let _ = shutdown.send(true);

    // A thread cannot join itself
    if thread.thread().id() == std::thread::current().id() {
        debug!(%connection_id, "Teardown from the event-loop thread, detaching it");
        drop(bridge);
        return Ok(());
    }

    let joined = thread.join();

    drop(bridge);
    match joined {
        Ok((event_loop, session)) => {
            let (engine, transport) = session.into_parts();
            drop(engine);
            drop(transport);
            drop(event_loop);
            debug!(%connection_id, "Connection torn down");
            Ok(())
        }
        Err(_) => {
            error!(%connection_id, "Event loop thread panicked");
            Err(StreamerError::EventLoopPanicked)
        }
    }
}

/// Everything the event-loop thread owns while it runs
struct EventLoopWorker<E: ProtocolEngine> {
    event_loop: EventLoop,
    session: Session<E>,
    tasks: mpsc::UnboundedReceiver<LoopTask<E>>,
    shutdown: watch::Receiver<bool>,
    connected: std_mpsc::SyncSender<Result<(), TransportError>>,
    bridge: Arc<Bridge<E>>,
    on_error: ErrorCallback,
    dispatch: Dispatch,
}

impl<E: ProtocolEngine> EventLoopWorker<E> {
    fn run(self) -> LoopRemains<E> {
        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || self.drive())
    }

    fn drive(self) -> LoopRemains<E> {
        let EventLoopWorker {
            event_loop,
            mut session,
            mut tasks,
            mut shutdown,
            connected,
            bridge,
            on_error,
            dispatch: _,
        } = self;

        let span = crate::connection_span!(
            connection_id = %session.connection_id(),
            host = %session.host(),
            port = session.port()
        );
        let _entered = span.enter();

        let outcome = event_loop.block_on(async {
            match session.establish(&mut tasks, &mut shutdown).await {
                Ok(Established::Connected) => {
                    let _ = connected.send(Ok(()));
                }
                Ok(Established::Stopped) => {
                    let _ = connected.send(Ok(()));
                    return Ok(());
                }
                Err(e) => {
                    // Reported to connect(), not to the callback
                    let _ = connected.send(Err(e));
                    return Ok(());
                }
            }
            session.pump(&mut tasks, &mut shutdown).await
        });

        if let Err(failure) = outcome {
            error!(stage = ?failure.stage(), "Event loop failed: {}", failure);
            let reason = failure.to_string();
            on_error(StreamerError::Transport(failure));
            bridge.fail(PublishError::ConnectionFailed(reason));
        }
        bridge.stop();
        debug!(state = ?session.state(), "Event loop finished");

        drop(tasks);
        (event_loop, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::testing::{CapturedLogs, MockConfirm, MockEngine};
    use std::net::TcpListener;
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    fn mock_factory(engine: MockEngine) -> EngineFactory<MockEngine> {
        let template = Mutex::new(Some(engine));
        Box::new(move |_server, _handler| {
            template
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| EngineError::Protocol("factory exhausted".to_string()))
        })
    }

    fn collecting_callback() -> (Arc<Mutex<Vec<String>>>, impl Fn(StreamerError) + Send + Sync) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        (errors, move |error: StreamerError| {
            sink.lock().unwrap().push(error.to_string())
        })
    }

    fn listener() -> (TcpListener, ServerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ServerConfig::new("127.0.0.1", port))
    }

    #[test]
    fn test_publish_before_connect_is_not_connected() {
        let (_listener, server) = listener();
        let streamer = Streamer::new(
            server,
            TransportSettings::default(),
            mock_factory(MockEngine::new()),
            |_| {},
        );
        assert_eq!(
            streamer.publish("t", "k", "type", &b"x"[..]),
            Err(PublishError::NotConnected)
        );
        assert_eq!(streamer.connection_state(), ConnectionState::NotConnected);
        assert!(!streamer.is_running());
    }

    #[test]
    fn test_connect_and_publish_with_synchronous_ack() {
        let (listener, server) = listener();
        let engine = MockEngine::new();
        let record = engine.record();
        let streamer = Streamer::new(
            server,
            TransportSettings::default(),
            mock_factory(engine),
            |_| {},
        );

        streamer.connect().unwrap();
        let (_peer, _) = listener.accept().unwrap();
        assert!(streamer.is_running());
        assert!(streamer.connection_id().is_some());

        streamer.publish("t", "po=test", "type", vec![7u8; 500]).unwrap();

        let record = record.lock().unwrap();
        assert_eq!(record.channels_opened, 1);
        assert_eq!(record.published.len(), 1);
        assert_eq!(record.published[0].envelope.message_type(), Some("type"));
        assert_eq!(record.published[0].envelope.len(), 500);
    }

    #[test]
    fn test_connect_refused_is_returned_not_called_back() {
        let (listener, server) = listener();
        drop(listener);
        let (errors, callback) = collecting_callback();
        let streamer = Streamer::new(
            server,
            TransportSettings::default(),
            mock_factory(MockEngine::new()),
            callback,
        );

        let error = streamer.connect().unwrap_err();
        assert!(matches!(error, StreamerError::Transport(TransportError::Network { .. })));
        assert!(errors.lock().unwrap().is_empty());
        assert!(!streamer.is_running());
        assert_eq!(
            streamer.publish("t", "k", "type", &b"x"[..]),
            Err(PublishError::NotConnected)
        );
    }

    #[test]
    fn test_engine_setup_failures_are_returned() {
        let (_listener, server) = listener();
        let streamer = Streamer::new(
            server.clone(),
            TransportSettings::default(),
            mock_factory(MockEngine::new().fail_open_channel()),
            |_| {},
        );
        assert!(matches!(streamer.connect(), Err(StreamerError::Engine(_))));

        let failing: EngineFactory<MockEngine> =
            Box::new(|_, _| Err(EngineError::Protocol("bad credentials".to_string())));
        let streamer = Streamer::new(server, TransportSettings::default(), failing, |_| {});
        let error = streamer.connect().unwrap_err();
        assert!(error.to_string().contains("bad credentials"));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_connecting() {
        let streamer = Streamer::new(
            ServerConfig::new("", 5672),
            TransportSettings::default(),
            mock_factory(MockEngine::new()),
            |_| {},
        );
        assert!(matches!(streamer.connect(), Err(StreamerError::Config(_))));
    }

    #[test]
    fn test_stop_from_other_thread_aborts_publish() {
        let (listener, server) = listener();
        let streamer = Arc::new(Streamer::new(
            server,
            TransportSettings::default(),
            mock_factory(MockEngine::new().with_confirm(MockConfirm::Hold)),
            |_| {},
        ));
        streamer.connect().unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let publisher = {
            let streamer = Arc::clone(&streamer);
            thread::spawn(move || streamer.publish("t", "k", "type", vec![0u8; 500]))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        streamer.stop();
        let result = publisher.join().unwrap();

        assert_eq!(result, Err(PublishError::Aborted));
        assert_eq!(result.unwrap_err().to_string(), "Operation aborted.");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!streamer.is_running());
    }

    #[test]
    fn test_peer_close_reaches_callback_and_fails_bridge() {
        let (listener, server) = listener();
        let (errors, callback) = collecting_callback();
        let streamer = Streamer::new(
            server,
            TransportSettings::default(),
            mock_factory(MockEngine::new()),
            callback,
        );
        streamer.connect().unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while streamer.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let errors = errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("source: read"), "unexpected error: {}", errors[0]);
        assert!(matches!(streamer.connection_state(), ConnectionState::Failed(_)));
        assert!(matches!(
            streamer.publish("t", "k", "type", &b"x"[..]),
            Err(PublishError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_stop_from_error_callback_does_not_deadlock() {
        let (listener, server) = listener();
        let slot: Arc<OnceLock<Weak<Streamer<MockEngine>>>> = Arc::new(OnceLock::new());
        let (stopped_tx, stopped_rx) = std_mpsc::channel();

        let factory: EngineFactory<MockEngine> = Box::new(|_, _| Ok(MockEngine::new()));
        let callback_slot = Arc::clone(&slot);
        let streamer = Arc::new(Streamer::new(
            server,
            TransportSettings::default(),
            factory,
            move |_error| {
                if let Some(streamer) = callback_slot.get().and_then(Weak::upgrade) {
                    streamer.stop();
                }
                let _ = stopped_tx.send(());
            },
        ));
        slot.set(Arc::downgrade(&streamer)).unwrap();

        streamer.connect().unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(streamer.connection_state(), ConnectionState::NotConnected);
        assert_eq!(
            streamer.publish("t", "k", "type", &b"x"[..]),
            Err(PublishError::NotConnected)
        );

        // The detached thread leaves the streamer usable
        streamer.connect().unwrap();
        let (_second, _) = listener.accept().unwrap();
        streamer.publish("t", "k", "type", &b"x"[..]).unwrap();
        streamer.stop();
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let (listener, server) = listener();
        let factory: EngineFactory<MockEngine> = Box::new(|_, _| Ok(MockEngine::new()));
        let streamer = Streamer::new(server, TransportSettings::default(), factory, |_| {});

        streamer.connect().unwrap();
        let (_first, _) = listener.accept().unwrap();
        let first_id = streamer.connection_id();

        streamer.connect().unwrap();
        let (_second, _) = listener.accept().unwrap();
        assert_ne!(streamer.connection_id(), first_id);
        streamer.publish("t", "k", "type", &b"x"[..]).unwrap();

        streamer.stop();
        streamer.stop();
        assert_eq!(streamer.connection_state(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_background_logs_reach_callers_subscriber() {
        let logs = CapturedLogs::new();
        let (listener, server) = listener();
        tracing::dispatcher::with_default(&logs.dispatch(), || {
            let streamer = Streamer::new(
                server,
                TransportSettings::default(),
                mock_factory(MockEngine::new()),
                |_| {},
            );
            streamer.connect().unwrap();
            let (_peer, _) = listener.accept().unwrap();
            streamer.stop();
        });

        assert!(logs.contains("Connecting to broker"));
        assert!(!logs.from_thread(EVENT_LOOP_THREAD).is_empty());
    }
}
