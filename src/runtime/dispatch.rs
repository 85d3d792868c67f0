//! The per-agent dispatch loop.
//!
//! One consumer task drains the main queue. For each event it runs every
//! block handler serially (diffing the context around each invocation),
//! notifies plain listeners, then fans the event out to one private queue
//! per stream handler. Stream consumers run concurrently and record their
//! outcomes into the same history entry as the block pass.

use crate::context::{ContextEditor, ContextStore, ContextView};
use crate::event::bus::EventBus;
use crate::event::history::HandlerResult;
use crate::event::{ContextChange, Event, EventPayload};
use crate::runtime::{EventSink, HandlerRegistry, StreamHandler};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Wires the main queue and the per-stream-handler queues to their
/// consumer tasks.
pub struct Dispatcher {
    pub bus: Arc<EventBus>,
    pub context: Arc<ContextStore>,
    pub registry: Arc<HandlerRegistry>,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    /// Spawn the main-loop task plus one consumer task per stream handler.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let mut stream_txs = Vec::new();

        for handler in self.registry.streams() {
            let (tx, rx) = mpsc::unbounded_channel::<Event>();
            stream_txs.push(tx);
            tasks.push(tokio::spawn(stream_consumer(
                Arc::clone(handler),
                rx,
                Arc::clone(&self.bus),
                Arc::clone(&self.context),
                self.cancel.clone(),
            )));
        }

        tasks.push(tokio::spawn(main_loop(
            self.bus,
            self.context,
            self.registry,
            stream_txs,
            self.cancel,
        )));
        tasks
    }
}

async fn main_loop(
    bus: Arc<EventBus>,
    context: Arc<ContextStore>,
    registry: Arc<HandlerRegistry>,
    stream_txs: Vec<mpsc::UnboundedSender<Event>>,
    cancel: CancellationToken,
) {
    let queue = bus.queue();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = queue.pop() => {
                process_event(event, &bus, &context, &registry, &stream_txs).await;
            }
        }
    }
    debug!("dispatch loop halted");
}

/// Run the block pass for one event, then fan it out.
async fn process_event(
    mut event: Event,
    bus: &Arc<EventBus>,
    context: &Arc<ContextStore>,
    registry: &Arc<HandlerRegistry>,
    stream_txs: &[mpsc::UnboundedSender<Event>],
) {
    debug!(event = event.name(), id = %event.id, "dispatch");
    bus.history()
        .open(&event.id, event.name(), registry.names());

    for handler in registry.blocks() {
        let sink = EventSink::new(bus.queue(), handler.name(), &event.id);
        let editor = ContextEditor::new(Arc::clone(context));
        let before = context.snapshot();

        let outcome = handler.on_event(&event, &editor, &sink).await;

        let after = context.snapshot();
        if before != after {
            event.context_changes.push(ContextChange {
                at: Utc::now(),
                by_handler: handler.name().to_owned(),
                before: before.clone(),
                after: after.clone(),
            });
            context.notify_changed(&before, &after);
        }

        record_outcome(bus, &event.id, handler.name(), outcome);
    }

    bus.notify_listeners(&event);

    for tx in stream_txs {
        // A closed receiver means that consumer already shut down; the
        // remaining fan-out still proceeds.
        let _ = tx.send(event.clone());
    }
}

async fn stream_consumer(
    handler: Arc<dyn StreamHandler>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    bus: Arc<EventBus>,
    context: Arc<ContextStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        let sink = EventSink::new(bus.queue(), handler.name(), &event.id);
        let view = ContextView::new(Arc::clone(&context));
        let outcome = handler.on_event(&event, &view, &sink).await;
        record_outcome(&bus, &event.id, handler.name(), outcome);
    }
    debug!(handler = handler.name(), "stream consumer halted");
}

/// Record a handler outcome in the history; failures are logged and
/// converted into an `agent.error` event rather than halting anything.
fn record_outcome(
    bus: &Arc<EventBus>,
    event_id: &str,
    handler: &str,
    outcome: crate::error::Result<()>,
) {
    match outcome {
        Ok(()) => {
            bus.history().record(event_id, handler, HandlerResult::Ok);
        }
        Err(e) => {
            error!(handler, event = event_id, "handler failed: {e}");
            bus.history().record(
                event_id,
                handler,
                HandlerResult::Error {
                    kind: e.kind().to_owned(),
                    message: e.to_string(),
                },
            );
            // Avoid error storms: a failure while processing agent.error
            // is recorded but not re-emitted.
            let is_error_event = bus
                .history()
                .entry(event_id)
                .is_some_and(|entry| entry.event_name == "agent.error");
            if !is_error_event {
                let sink = EventSink::new(bus.queue(), handler, event_id);
                sink.emit(EventPayload::Error {
                    message: e.to_string(),
                    handler: Some(handler.to_owned()),
                });
            }
        }
    }
}
