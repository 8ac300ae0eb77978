//! Synchronous wrapper around one confirmed-publish channel
//!
//! `publish` blocks until the broker acknowledges or loses the message. If the
//! event loop is not forwarding anything (not running, or the connection died
//! silently) the call blocks indefinitely; [`PublishBridge::stop`] from another
//! thread is the way to short-circuit it. There is no implicit timeout.
//!
//! Any channel error invalidates the whole channel, including instructions
//! already sent on it. The bridge therefore stays failed after its first
//! error and every later publish fails fast. Recovering means building a new
//! bridge on a new channel.

use super::{ChannelExecutor, PublishError, PublishRequest};
use crate::engine::Deferred;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// State of the current operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Pending,
    Succeeded,
    Failed(PublishError),
}

#[derive(Debug)]
struct BridgeState {
    /// Sequence number of the current operation; stale callbacks are ignored
    operation: u64,
    outcome: OperationOutcome,
    /// Sticky channel failure
    failure: Option<PublishError>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BridgeState>,
    finished: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn succeed(&self, operation: u64) {
        let mut state = lock(&self.state);
        if state.operation == operation && state.outcome == OperationOutcome::Pending {
            state.outcome = OperationOutcome::Succeeded;
        }
        self.finished.notify_all();
    }

    fn fail(&self, operation: Option<u64>, error: PublishError) {
        let mut state = lock(&self.state);
        if state.failure.is_none() {
            state.failure = Some(error.clone());
        }
        let current = operation.map_or(true, |op| op == state.operation);
        if current && state.outcome == OperationOutcome::Pending {
            state.outcome = OperationOutcome::Failed(error);
        }
        self.finished.notify_all();
    }
}

/// Makes one asynchronous publish look like one blocking call
pub struct PublishBridge<C> {
    executor: C,
    publish_lock: Mutex<()>,
    shared: Arc<Shared>,
}

impl<C: ChannelExecutor> PublishBridge<C> {
    pub fn new(executor: C) -> Self {
        Self {
            executor,
            publish_lock: Mutex::new(()),
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState {
                    operation: 0,
                    outcome: OperationOutcome::Succeeded,
                    failure: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    /// Publish and block until the broker confirms or loses the message.
    ///
    /// Concurrent callers are serialised; each observes its own outcome.
    pub fn publish(&self, request: PublishRequest) -> Result<(), PublishError> {
        let _serialized = lock(&self.publish_lock);

        let operation = {
            let mut state = lock(&self.shared.state);
            state.operation += 1;
            state.outcome = OperationOutcome::Pending;
            if let Some(failure) = state.failure.clone() {
                debug!(error = %failure, "Channel already failed, not publishing");
                state.outcome = OperationOutcome::Failed(failure.clone());
                return Err(failure);
            }
            state.operation
        };

        debug!(
            operation,
            topic = %request.topic,
            routing_key = %request.routing_key,
            bytes = request.envelope.len(),
            "Publishing"
        );

        let acked = Arc::clone(&self.shared);
        let lost = Arc::clone(&self.shared);
        let confirm = Deferred::new()
            .on_ack(move || {
                debug!(operation, "Publish acknowledged");
                acked.succeed(operation);
            })
            .on_lost(move |reason| {
                warn!(operation, reason = %reason, "Publish lost");
                lost.fail(Some(operation), PublishError::Lost(reason));
            });

        if let Err(error) = self.executor.submit(request, confirm) {
            // The dropped confirmation may already have recorded a loss; the
            // submit error is the real cause.
            let mut state = lock(&self.shared.state);
            state.failure = Some(error.clone());
            state.outcome = OperationOutcome::Failed(error.clone());
            self.shared.finished.notify_all();
            return Err(error);
        }

        self.wait_for_operation_to_finish()
    }

    fn wait_for_operation_to_finish(&self) -> Result<(), PublishError> {
        let state = self
            .shared
            .finished
            .wait_while(lock(&self.shared.state), |state| {
                state.outcome == OperationOutcome::Pending && state.failure.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);

        match &state.outcome {
            OperationOutcome::Succeeded => Ok(()),
            OperationOutcome::Failed(error) => Err(error.clone()),
            OperationOutcome::Pending => Err(state.failure.clone().unwrap_or(PublishError::Aborted)),
        }
    }

    /// Abort: fail the bridge and wake any blocked publish.
    ///
    /// Safe from any thread, any number of times.
    pub fn stop(&self) {
        self.fail(PublishError::Aborted);
    }

    /// Mark the channel failed with `error` and wake any blocked publish
    pub fn fail(&self, error: PublishError) {
        debug!(error = %error, "Failing publish bridge");
        self.shared.fail(None, error);
    }

    pub fn is_failed(&self) -> bool {
        lock(&self.shared.state).failure.is_some()
    }

    /// The error that invalidated the channel, if any
    pub fn failure(&self) -> Option<PublishError> {
        lock(&self.shared.state).failure.clone()
    }

    /// Outcome of the most recent operation
    pub fn outcome(&self) -> OperationOutcome {
        lock(&self.shared.state).outcome.clone()
    }

    pub fn executor(&self) -> &C {
        &self.executor
    }
}

impl<C> Drop for PublishBridge<C> {
    fn drop(&mut self) {
        self.shared.fail(None, PublishError::Aborted);
    }
}
