//! Wren: event-dispatch runtime for a conversational voice/text agent.
//!
//! One agent process ingests raw input events (audio chunks, text chunks,
//! control signals), drives them through block and stream handlers, and
//! emits generated text, speech, and side effects back across the
//! transport boundary.
//!
//! # Architecture
//!
//! Events flow through an ordered, urgent-aware queue:
//! - **Block handlers** run serially per event with read/write access to
//!   the conversation context; the loop diffs the context around each one.
//! - **Stream handlers** (voice activity, transcription, end-of-turn,
//!   generation) each drain a private queue concurrently with read-only
//!   snapshots.
//!
//! Model providers and the room transport stay outside the crate, behind
//! the capability traits in [`capability`] and [`transport`].

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod handlers;
pub mod message;
pub mod provider;
pub mod runtime;
pub mod telemetry;
pub mod transport;

pub use capability::Capabilities;
pub use config::AgentConfig;
pub use context::{Context, ContextView};
pub use error::{AgentError, Result};
pub use event::bus::{EventBus, EventSelector, WaitTarget};
pub use event::{Event, EventPayload, EventSource};
pub use message::{Message, MessageLog};
pub use provider::ProviderSet;
pub use runtime::server::AgentServer;
