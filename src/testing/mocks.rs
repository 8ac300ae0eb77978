//! Mock implementations for testing
//!
//! Provides a scriptable [`ProtocolEngine`] and [`ChannelExecutor`] so the
//! transport and the publish bridge can be exercised without a broker.

use crate::bridge::{ChannelExecutor, PublishError, PublishRequest};
use crate::engine::{
    ChannelId, ConnectionHandler, Deferred, EngineError, Envelope, ProtocolEngine,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How a mock resolves the confirmations it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockConfirm {
    /// Acknowledge synchronously inside the publish call
    Ack,
    /// Lose synchronously inside the publish call
    Lose,
    /// Keep the confirmation until the test releases it
    Hold,
    /// Acknowledge from another thread after a delay
    AckAfter(Duration),
    /// Refuse the submission itself
    RejectSubmit,
}

/// Reason used when a mock loses a message
pub const MOCK_LOSS_REASON: &str = "mock broker rejected the message";

/// One publish seen by [`MockEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPublish {
    pub channel: ChannelId,
    pub topic: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

/// Everything a [`MockEngine`] observed, shared with the test
#[derive(Debug, Default)]
pub struct MockEngineRecord {
    pub parsed: Vec<u8>,
    pub parse_calls: usize,
    pub channels_opened: usize,
    pub published: Vec<MockPublish>,
    pub held: Vec<Deferred>,
}

/// Scriptable protocol engine
#[derive(Debug)]
pub struct MockEngine {
    frame_size: usize,
    parse_failure: Option<String>,
    confirm: MockConfirm,
    fail_open_channel: bool,
    record: Arc<Mutex<MockEngineRecord>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Consumes all input, acknowledges every publish
    pub fn new() -> Self {
        Self {
            frame_size: 0,
            parse_failure: None,
            confirm: MockConfirm::Ack,
            fail_open_channel: false,
            record: Arc::new(Mutex::new(MockEngineRecord::default())),
        }
    }

    /// Only consume whole multiples of `frame_size` bytes (0 consumes all)
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Report `message` as a fatal error on the first non-empty parse
    pub fn fail_on_parse(mut self, message: impl Into<String>) -> Self {
        self.parse_failure = Some(message.into());
        self
    }

    pub fn with_confirm(mut self, confirm: MockConfirm) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn fail_open_channel(mut self) -> Self {
        self.fail_open_channel = true;
        self
    }

    pub fn record(&self) -> Arc<Mutex<MockEngineRecord>> {
        Arc::clone(&self.record)
    }
}

impl ProtocolEngine for MockEngine {
    fn parse(&mut self, input: &[u8], handler: &mut dyn ConnectionHandler) -> usize {
        let consumed = match self.frame_size {
            0 => input.len(),
            size => input.len() / size * size,
        };

        let mut record = self.record.lock().unwrap();
        record.parse_calls += 1;
        record.parsed.extend_from_slice(&input[..consumed]);

        if !input.is_empty() {
            if let Some(message) = self.parse_failure.take() {
                handler.on_error(&message);
            }
        }
        consumed
    }

    fn open_channel(
        &mut self,
        handler: &mut dyn ConnectionHandler,
    ) -> Result<ChannelId, EngineError> {
        if self.fail_open_channel {
            return Err(EngineError::Protocol("channel open refused".to_string()));
        }
        let mut record = self.record.lock().unwrap();
        record.channels_opened += 1;
        handler.on_data(b"CHANNEL");
        Ok(record.channels_opened as ChannelId)
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
        let mut record = self.record.lock().unwrap();
        record.published.push(MockPublish {
            channel,
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });
        handler.on_data(&envelope.payload);

        match self.confirm {
            MockConfirm::Ack => confirm.acknowledge(),
            MockConfirm::Lose => confirm.lose(MOCK_LOSS_REASON),
            MockConfirm::Hold => record.held.push(confirm),
            MockConfirm::AckAfter(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    confirm.acknowledge();
                });
            }
            MockConfirm::RejectSubmit => {
                let error = EngineError::ChannelUnavailable(channel);
                confirm.lose(error.to_string());
                return Err(error);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockChannelState {
    submitted: Mutex<Vec<PublishRequest>>,
    held: Mutex<Vec<Deferred>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Channel executor that resolves confirmations according to [`MockConfirm`].
///
/// Clones share their history.
#[derive(Debug, Clone)]
pub struct MockChannel {
    confirm: MockConfirm,
    state: Arc<MockChannelState>,
}

impl MockChannel {
    pub fn new(confirm: MockConfirm) -> Self {
        Self {
            confirm,
            state: Arc::new(MockChannelState::default()),
        }
    }

    pub fn submitted(&self) -> Vec<PublishRequest> {
        self.state.submitted.lock().unwrap().clone()
    }

    /// Highest number of publishes outstanding at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Acknowledge every held confirmation
    pub fn release_all(&self) {
        let held: Vec<Deferred> = self.state.held.lock().unwrap().drain(..).collect();
        for confirm in held {
            confirm.acknowledge();
        }
    }

    /// Lose every held confirmation
    pub fn lose_all(&self, reason: &str) {
        let held: Vec<Deferred> = self.state.held.lock().unwrap().drain(..).collect();
        for confirm in held {
            confirm.lose(reason);
        }
    }
}

impl ChannelExecutor for MockChannel {
    fn submit(&self, request: PublishRequest, confirm: Deferred) -> Result<(), PublishError> {
        if self.confirm == MockConfirm::RejectSubmit {
            return Err(PublishError::Submit("event loop is not running".to_string()));
        }

        let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.state.submitted.lock().unwrap().push(request);

        match self.confirm {
            MockConfirm::Ack => {
                self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                confirm.acknowledge();
            }
            MockConfirm::Lose => {
                self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                confirm.lose(MOCK_LOSS_REASON);
            }
            MockConfirm::Hold => {
                self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.state.held.lock().unwrap().push(confirm);
            }
            MockConfirm::AckAfter(delay) => {
                let state = Arc::clone(&self.state);
                thread::spawn(move || {
                    thread::sleep(delay);
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                    confirm.acknowledge();
                });
            }
            MockConfirm::RejectSubmit => {}
        }
        Ok(())
    }
}
