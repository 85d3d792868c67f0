//! Handler model and registry.
//!
//! Handlers come in two disciplines. Block handlers run serially, in
//! registration order, with read/write context access; all of them finish
//! before any stream handler sees the event. Stream handlers run
//! concurrently, each behind its own FIFO queue, with read-only snapshots.

pub mod dispatch;
pub mod server;

use crate::context::{ContextEditor, ContextView};
use crate::error::{AgentError, Result};
use crate::event::bus::EventQueue;
use crate::event::{Event, EventPayload, EventSource};
use async_trait::async_trait;
use std::sync::Arc;

/// Emitter handed to one handler invocation. Events it emits are tagged
/// with the handler name and the event being processed.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    source: EventSource,
}

impl EventSink {
    pub fn new(queue: Arc<EventQueue>, handler: &str, event_id: &str) -> Self {
        Self {
            queue,
            source: EventSource::handler(handler, event_id),
        }
    }

    /// Emitter for runtime-internal emission outside any handler.
    pub fn server(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            source: EventSource::server(),
        }
    }

    /// Enqueue an event at the back of the main queue.
    pub fn emit(&self, payload: EventPayload) -> String {
        self.push(payload, false)
    }

    /// Enqueue an event at the front of the main queue.
    pub fn emit_urgent(&self, payload: EventPayload) -> String {
        self.push(payload, true)
    }

    fn push(&self, payload: EventPayload, urgent: bool) -> String {
        let event = Event::new(payload, urgent, self.source.clone());
        let id = event.id.clone();
        self.queue.push(event);
        id
    }
}

/// Serial, context-mutating handler.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Unique handler name, used in history entries and attribution.
    fn name(&self) -> &'static str;

    /// Process one event. Runs to completion before the next block handler
    /// starts.
    async fn on_event(
        &self,
        event: &Event,
        context: &ContextEditor,
        events: &EventSink,
    ) -> Result<()>;

    /// Drop private state on agent stop.
    fn reset(&self) {}
}

/// Concurrent, read-only handler with its own event queue.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_event(
        &self,
        event: &Event,
        context: &ContextView,
        events: &EventSink,
    ) -> Result<()>;

    fn reset(&self) {}
}

/// Ordered collection of an agent's handlers. Built once per agent; handler
/// private state lives inside the handler values and is torn down via
/// [`HandlerRegistry::reset_all`].
#[derive(Default)]
pub struct HandlerRegistry {
    blocks: Vec<Arc<dyn BlockHandler>>,
    streams: Vec<Arc<dyn StreamHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block handler.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name collides with a registered handler.
    pub fn register_block(&mut self, handler: Arc<dyn BlockHandler>) -> Result<()> {
        self.check_name(handler.name())?;
        self.blocks.push(handler);
        Ok(())
    }

    /// Append a stream handler.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name collides with a registered handler.
    pub fn register_stream(&mut self, handler: Arc<dyn StreamHandler>) -> Result<()> {
        self.check_name(handler.name())?;
        self.streams.push(handler);
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.names().iter().any(|n| n == name) {
            return Err(AgentError::Validation(format!(
                "duplicate handler name {name}"
            )));
        }
        Ok(())
    }

    pub fn blocks(&self) -> &[Arc<dyn BlockHandler>] {
        &self.blocks
    }

    pub fn streams(&self) -> &[Arc<dyn StreamHandler>] {
        &self.streams
    }

    /// All handler names, block handlers first, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .map(|h| h.name().to_owned())
            .chain(self.streams.iter().map(|h| h.name().to_owned()))
            .collect()
    }

    pub fn reset_all(&self) {
        for handler in &self.blocks {
            handler.reset();
        }
        for handler in &self.streams {
            handler.reset();
        }
    }
}
