//! Event-loop runtime and the handles other threads use to reach it

use crate::bridge::{ChannelExecutor, PublishError, PublishRequest};
use crate::engine::{ChannelId, Deferred, ProtocolEngine};
use crate::transport::{LoopTask, Session};
use std::fmt;
use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::warn;

/// Name of the background thread driving the event loop
pub const EVENT_LOOP_THREAD: &str = "amqp-event-loop";

/// The event loop stopped and no longer accepts tasks
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("event loop is not running")]
pub struct LoopClosed;

/// Single-threaded runtime that drives one connection
#[derive(Debug)]
pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(EVENT_LOOP_THREAD)
            .build()?;
        Ok(Self { runtime })
    }

    /// Run `future` to completion on the calling thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Posts closures onto the event-loop thread
pub struct LoopHandle<E> {
    tasks: mpsc::UnboundedSender<LoopTask<E>>,
}

impl<E> Clone for LoopHandle<E> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
        }
    }
}

impl<E> fmt::Debug for LoopHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.tasks.is_closed())
            .finish()
    }
}

impl<E: ProtocolEngine> LoopHandle<E> {
    pub fn new(tasks: mpsc::UnboundedSender<LoopTask<E>>) -> Self {
        Self { tasks }
    }

    /// Queue `task` to run on the event loop between socket events
    pub fn post<F>(&self, task: F) -> Result<(), LoopClosed>
    where
        F: FnOnce(&mut Session<E>) + Send + 'static,
    {
        self.tasks.send(Box::new(task)).map_err(|_| LoopClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }
}

/// Channel executor that marshals every publish onto the event loop
pub struct LoopChannel<E> {
    channel: ChannelId,
    handle: LoopHandle<E>,
}

impl<E> fmt::Debug for LoopChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopChannel")
            .field("channel", &self.channel)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<E: ProtocolEngine> LoopChannel<E> {
    pub fn new(channel: ChannelId, handle: LoopHandle<E>) -> Self {
        Self { channel, handle }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl<E: ProtocolEngine> ChannelExecutor for LoopChannel<E> {
    fn submit(&self, request: PublishRequest, confirm: Deferred) -> Result<(), PublishError> {
        let channel = self.channel;
        self.handle
            .post(move |session| {
                let (engine, handler) = session.engine_and_handler();
                if let Err(e) = engine.publish(
                    channel,
                    &request.topic,
                    &request.routing_key,
                    &request.envelope,
                    confirm,
                    handler,
                ) {
                    warn!(channel, error = %e, "Engine refused publish");
                }
            })
            .map_err(|closed| PublishError::Submit(closed.to_string()))
    }
}
