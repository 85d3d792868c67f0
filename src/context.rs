//! Shared conversation state and its accessors.
//!
//! The [`Context`] is exclusively owned by one agent instance. Block
//! handlers receive a [`ContextEditor`] (read/write); stream handlers and
//! external callers receive a [`ContextView`] whose reads are isolated deep
//! copies, so they can never race a mutation.

use crate::error::{AgentError, Result};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Turn-taking status flags. Handlers keep at most one of these driving
/// turn-taking at a time; the type itself does not enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStatus {
    /// Waiting for (or receiving) user input.
    pub listening: bool,
    /// A generation job is underway.
    pub thinking: bool,
    /// Spoken output is being produced.
    pub speaking: bool,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            listening: true,
            thinking: false,
            speaking: false,
        }
    }
}

/// The whole conversation state for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub messages: Vec<Message>,
    pub status: AgentStatus,
    pub voice_enabled: bool,
}

impl Context {
    /// Check structural invariants. Called once at agent construction;
    /// a failure here is fatal.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if message ids repeat.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for message in &self.messages {
            if !seen.insert(message.id.as_str()) {
                return Err(AgentError::Validation(format!(
                    "duplicate message id {} in initial context",
                    message.id
                )));
            }
        }
        Ok(())
    }
}

/// A projection of the context watched by an `on_change` listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    Messages,
    Status,
    VoiceEnabled,
}

impl ContextField {
    /// Value-equality comparison of this field between two snapshots.
    pub fn differs(&self, before: &Context, after: &Context) -> bool {
        match self {
            Self::Messages => before.messages != after.messages,
            Self::Status => before.status != after.status,
            Self::VoiceEnabled => before.voice_enabled != after.voice_enabled,
        }
    }
}

type ChangeCallback = Box<dyn Fn(&Context) + Send + Sync>;

struct ChangeListener {
    id: u64,
    field: ContextField,
    callback: ChangeCallback,
}

/// Owner of the mutable context plus its change listeners.
pub struct ContextStore {
    inner: Mutex<Context>,
    listeners: Mutex<Vec<ChangeListener>>,
    next_listener_id: AtomicU64,
}

impl ContextStore {
    /// Wrap an initial context, validating it first.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the initial context is malformed.
    pub fn new(initial: Context) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            inner: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Deep copy of the current context.
    pub fn snapshot(&self) -> Context {
        self.inner.lock().expect("context lock poisoned").clone()
    }

    fn replace(&self, value: Context) {
        *self.inner.lock().expect("context lock poisoned") = value;
    }

    /// Register a listener fired when `field`'s value actually changes.
    /// Returns an id usable with [`ContextStore::remove_listener`].
    pub fn on_change<F>(&self, field: ContextField, callback: F) -> u64
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(ChangeListener {
                id,
                field,
                callback: Box::new(callback),
            });
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|l| l.id != id);
    }

    /// Invoke listeners whose watched field differs between the snapshots.
    /// Called by the dispatch loop after a block handler mutated context.
    pub fn notify_changed(&self, before: &Context, after: &Context) {
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            if listener.field.differs(before, after) {
                (listener.callback)(after);
            }
        }
    }
}

/// Read-only context accessor handed to stream handlers and external
/// callers. Every read is an isolated deep copy.
#[derive(Clone)]
pub struct ContextView {
    store: Arc<ContextStore>,
}

impl ContextView {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self { store }
    }

    pub fn get(&self) -> Context {
        self.store.snapshot()
    }
}

/// Read/write context accessor, granted only to block handlers. By
/// convention a block handler calls [`ContextEditor::set`] or
/// [`ContextEditor::update`] at most once per invocation; the dispatch loop
/// serializes block handlers, so writes never contend.
#[derive(Clone)]
pub struct ContextEditor {
    store: Arc<ContextStore>,
}

impl ContextEditor {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self { store }
    }

    pub fn get(&self) -> Context {
        self.store.snapshot()
    }

    /// Replace the whole context.
    pub fn set(&self, value: Context) {
        self.store.replace(value);
    }

    /// Apply an updater to a copy of the current context and store the
    /// result.
    pub fn update<F>(&self, updater: F)
    where
        F: FnOnce(Context) -> Context,
    {
        let current = self.store.snapshot();
        self.store.replace(updater(current));
    }
}
