//! Real-time transport boundary.
//!
//! The room/media layer lives outside this crate. The runtime only needs to
//! receive client-originated events and push audio/text back out.

use crate::capability::AudioChunk;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An event arriving from the client side of the transport, not yet
/// validated against the runtime's event vocabulary.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub name: String,
    pub data: serde_json::Value,
}

/// Transport capability consumed by the agent server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the named room.
    async fn join_room(&self, name: &str, token: &str) -> Result<()>;

    /// Leave the current room.
    async fn leave_room(&self) -> Result<()>;

    /// Receiver of client-originated events. Called once per agent start;
    /// the returned channel closes when the transport disconnects.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent>;

    /// Push one audio chunk to the room's media track.
    async fn stream_audio_chunk(&self, chunk: AudioChunk) -> Result<()>;

    /// Push a text fragment onto a pub/sub topic.
    async fn stream_text(&self, topic: &str, text: &str) -> Result<()>;
}
