//! Typed events flowing through the runtime.
//!
//! Every event name has exactly one payload shape. Typed construction is
//! valid by definition; raw payloads from the transport are validated by
//! deserializing into [`EventPayload`], so an unknown name or mismatched
//! data shape fails before anything is enqueued.

pub mod bus;
pub mod history;

use crate::capability::AudioChunk;
use crate::context::Context;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventSource {
    /// Emitted by the runtime itself, optionally attributed to the handler
    /// and the event it was processing at the time.
    Server {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    /// Emitted by the remote client over the transport.
    Client,
}

impl EventSource {
    /// A server source with no attribution (external caller on the server
    /// side, e.g. the composition root).
    pub fn server() -> Self {
        Self::Server {
            handler: None,
            event: None,
        }
    }

    /// A server source attributed to a handler processing an event.
    pub fn handler(handler: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Server {
            handler: Some(handler.into()),
            event: Some(event.into()),
        }
    }
}

/// Event payload, keyed by event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum EventPayload {
    /// The agent came up and handlers may open their capability jobs.
    #[serde(rename = "agent.start")]
    Start,

    /// Final control event; handlers tear down jobs and private state.
    #[serde(rename = "agent.stop")]
    Stop,

    /// A handler failed; the loop re-emitted the failure for observers.
    #[serde(rename = "agent.error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
    },

    /// Raw audio from the transport, before voice-activity classification.
    #[serde(rename = "incoming-audio")]
    AudioFrame { chunk: AudioChunk },

    /// The user started speaking.
    #[serde(rename = "incoming-voice-start")]
    VoiceStart,

    /// One chunk of user speech. `padding` marks pre/post-roll chunks
    /// replayed around the detected boundary.
    #[serde(rename = "incoming-voice")]
    Voice {
        chunk: AudioChunk,
        #[serde(default)]
        padding: bool,
    },

    /// The user stopped speaking.
    #[serde(rename = "incoming-voice-end")]
    VoiceEnd,

    /// A chunk of user text (live transcript or typed input).
    #[serde(rename = "incoming-text")]
    Text {
        chunk: String,
        #[serde(default)]
        is_final: bool,
    },

    /// The user barged in; running generation must yield.
    #[serde(rename = "interrupt")]
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A generation job was actually cancelled by an interrupt.
    #[serde(rename = "interruption")]
    Interruption { job_id: String },

    /// The agent should produce its next response.
    #[serde(rename = "continue")]
    Continue,

    /// Queue literal text for output, bypassing the model.
    #[serde(rename = "say")]
    Say {
        text: String,
        #[serde(default)]
        prevent_interruption: bool,
    },

    /// Ask the model whether a response is warranted before generating.
    #[serde(rename = "decide")]
    Decide {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },

    /// A chunk of generated agent text.
    #[serde(rename = "outgoing-text")]
    OutgoingText { chunk: String },

    /// A chunk of synthesized agent speech.
    #[serde(rename = "outgoing-voice")]
    OutgoingVoice { chunk: AudioChunk },

    /// Structured result of an action the model called.
    #[serde(rename = "outgoing-action-result")]
    OutgoingActionResult {
        action_id: String,
        action_name: String,
        /// Arguments the model supplied, echoed for the message log.
        #[serde(default)]
        arguments: serde_json::Value,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A generation job ran to completion (or was drained after cancel).
    #[serde(rename = "generation-ended")]
    GenerationEnded { job_id: String },
}

impl EventPayload {
    /// The event name this payload serializes under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "agent.start",
            Self::Stop => "agent.stop",
            Self::Error { .. } => "agent.error",
            Self::AudioFrame { .. } => "incoming-audio",
            Self::VoiceStart => "incoming-voice-start",
            Self::Voice { .. } => "incoming-voice",
            Self::VoiceEnd => "incoming-voice-end",
            Self::Text { .. } => "incoming-text",
            Self::Interrupt { .. } => "interrupt",
            Self::Interruption { .. } => "interruption",
            Self::Continue => "continue",
            Self::Say { .. } => "say",
            Self::Decide { .. } => "decide",
            Self::OutgoingText { .. } => "outgoing-text",
            Self::OutgoingVoice { .. } => "outgoing-voice",
            Self::OutgoingActionResult { .. } => "outgoing-action-result",
            Self::GenerationEnded { .. } => "generation-ended",
        }
    }

    /// Validate a raw `(name, data)` pair against the event vocabulary.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name is unknown or the data does not
    /// match the declared shape for that name.
    pub fn from_named(name: &str, data: serde_json::Value) -> Result<Self> {
        let mut tagged = serde_json::Map::new();
        tagged.insert("name".to_owned(), serde_json::Value::String(name.to_owned()));
        if !data.is_null() {
            tagged.insert("data".to_owned(), data);
        }
        serde_json::from_value(serde_json::Value::Object(tagged)).map_err(|e| {
            AgentError::Validation(format!("event {name} rejected: {e}"))
        })
    }
}

/// A recorded context mutation, appended only by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChange {
    pub at: DateTime<Utc>,
    pub by_handler: String,
    pub before: Context,
    pub after: Context,
}

/// Creation metadata for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub at: DateTime<Utc>,
    pub by: EventSource,
}

/// One event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique within the process lifetime.
    pub id: String,
    #[serde(default)]
    pub urgent: bool,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub created: EventMeta,
    #[serde(default)]
    pub context_changes: Vec<ContextChange>,
}

impl Event {
    /// Build an event with a fresh id and current timestamp.
    pub fn new(payload: EventPayload, urgent: bool, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            urgent,
            payload,
            created: EventMeta {
                at: Utc::now(),
                by: source,
            },
            context_changes: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}
