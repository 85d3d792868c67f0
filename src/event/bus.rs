//! The ordered, urgent-aware event bus.
//!
//! `emit` enqueues validated events (front of the queue when urgent);
//! `on`/`once` register selector listeners fired by the dispatch loop for
//! every processed event; `wait` resolves when the history shows an event
//! was handled, racing a 15-second timeout otherwise.

use crate::error::{AgentError, Result};
use crate::event::history::{EventHistory, HandlerRecord, HistoryEntry};
use crate::event::{Event, EventPayload, EventSource};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Upper bound on any `wait` call.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// FIFO queue with urgent front-insertion.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event; urgent events jump to the front, preempting
    /// everything enqueued but not yet picked up.
    pub fn push(&self, event: Event) {
        {
            let mut queue = self.inner.lock().expect("queue lock poisoned");
            if event.urgent {
                queue.push_front(event);
            } else {
                queue.push_back(event);
            }
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event, waiting if the queue is empty.
    pub async fn pop(&self) -> Event {
        loop {
            // Register for a wakeup before checking, so a push between the
            // check and the await is never lost.
            let notified = self.notify.notified();
            if let Some(event) = self.inner.lock().expect("queue lock poisoned").pop_front() {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Which events a listener receives.
#[derive(Debug, Clone)]
pub enum EventSelector {
    /// Every event.
    Any,
    /// Exactly one name.
    Name(String),
    /// Any of the listed names.
    OneOf(Vec<String>),
    /// Everything except the listed names.
    Not(Vec<String>),
}

impl EventSelector {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Name(n) => n == name,
            Self::OneOf(names) => names.iter().any(|n| n == name),
            Self::Not(names) => !names.iter().any(|n| n == name),
        }
    }
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

struct EventListener {
    id: u64,
    selector: EventSelector,
    once: bool,
    callback: EventCallback,
}

/// What `wait` is waiting for.
#[derive(Debug, Clone)]
pub enum WaitTarget {
    /// One named handler has recorded an outcome.
    Handler(String),
    /// Every expected handler has recorded an outcome.
    All,
}

/// The agent's event bus.
pub struct EventBus {
    queue: Arc<EventQueue>,
    history: EventHistory,
    listeners: Mutex<Vec<EventListener>>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            queue: Arc::new(EventQueue::new()),
            history: EventHistory::new(history_capacity),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    /// Enqueue a typed event. Returns the assigned event id.
    pub fn emit(&self, payload: EventPayload, urgent: bool, source: EventSource) -> Result<String> {
        let event = Event::new(payload, urgent, source);
        let id = event.id.clone();
        debug!(event = event.name(), id = %id, urgent, "emit");
        self.queue.push(event);
        Ok(id)
    }

    /// Validate and enqueue a raw `(name, data)` payload.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name is unknown or the data shape does
    /// not match (nothing is enqueued in that case).
    pub fn emit_raw(
        &self,
        name: &str,
        data: serde_json::Value,
        urgent: bool,
        source: EventSource,
    ) -> Result<String> {
        let payload = EventPayload::from_named(name, data)?;
        self.emit(payload, urgent, source)
    }

    /// Register a listener invoked for every processed event matching the
    /// selector. Returns an id usable with [`EventBus::off`].
    pub fn on<F>(&self, selector: EventSelector, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(selector, false, Box::new(callback))
    }

    /// Like [`EventBus::on`], but the listener is removed after its first
    /// matching event.
    pub fn once<F>(&self, selector: EventSelector, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(selector, true, Box::new(callback))
    }

    fn register(&self, selector: EventSelector, once: bool, callback: EventCallback) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(EventListener {
                id,
                selector,
                once,
                callback,
            });
        id
    }

    /// Remove a listener registered with `on`/`once`.
    pub fn off(&self, id: u64) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|l| l.id != id);
    }

    /// Invoke matching listeners for a processed event, dropping fired
    /// `once` listeners. Called by the dispatch loop after the block pass.
    pub fn notify_listeners(&self, event: &Event) {
        let mut fired_once = Vec::new();
        {
            let listeners = self.listeners.lock().expect("listener lock poisoned");
            for listener in listeners.iter() {
                if listener.selector.matches(event.name()) {
                    (listener.callback)(event);
                    if listener.once {
                        fired_once.push(listener.id);
                    }
                }
            }
        }
        if !fired_once.is_empty() {
            self.listeners
                .lock()
                .expect("listener lock poisoned")
                .retain(|l| !fired_once.contains(&l.id));
        }
    }

    /// Wait until `event_id` has been processed by the target handler (or
    /// all handlers). Resolves immediately from the history when already
    /// satisfied; otherwise races future history writes against
    /// [`WAIT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing satisfies the wait in time.
    pub async fn wait(&self, event_id: &str, target: WaitTarget) -> Result<Vec<HandlerRecord>> {
        self.wait_within(event_id, target, WAIT_TIMEOUT).await
    }

    async fn wait_within(
        &self,
        event_id: &str,
        target: WaitTarget,
        timeout: Duration,
    ) -> Result<Vec<HandlerRecord>> {
        // Subscribe before the history check so a write between the check
        // and the await is never missed.
        let mut updates = self.history.subscribe();

        if let Some(entry) = self.history.entry(event_id) {
            if let Some(records) = Self::satisfied(&entry, &target) {
                return Ok(records);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let update = tokio::time::timeout_at(deadline, updates.recv())
                .await
                .map_err(|_| {
                    AgentError::Timeout(format!(
                        "wait for event {event_id} exceeded {}ms",
                        timeout.as_millis()
                    ))
                })?;
            match update {
                Ok(update) if update.event_id == event_id => {
                    let Some(entry) = self.history.entry(event_id) else {
                        continue;
                    };
                    if let Some(records) = Self::satisfied(&entry, &target) {
                        return Ok(records);
                    }
                }
                Ok(_) => {}
                // Lagged: re-check the history snapshot directly.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(entry) = self.history.entry(event_id) {
                        if let Some(records) = Self::satisfied(&entry, &target) {
                            return Ok(records);
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(AgentError::Timeout(format!(
                        "history closed while waiting for event {event_id}"
                    )));
                }
            }
        }
    }

    fn satisfied(entry: &HistoryEntry, target: &WaitTarget) -> Option<Vec<HandlerRecord>> {
        match target {
            WaitTarget::Handler(handler) => {
                entry.result_for(handler).map(|r| vec![r.clone()])
            }
            WaitTarget::All => entry.is_complete().then(|| entry.results.clone()),
        }
    }
}
