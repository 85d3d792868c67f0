//! Model capability interfaces consumed by the runtime.
//!
//! Providers (speech classifiers, transcribers, language models,
//! synthesizers) live outside this crate. Each streaming capability hands
//! back a job: an input sender, an output receiver, and a cancellation
//! token. Consumers check the token each iteration; cancellation is
//! cooperative, never forced.

use crate::error::Result;
use crate::message::{ActionRequest, Message};
use crate::provider::ActionDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A chunk of mono audio samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// f32 samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Duration of this chunk in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// One classified audio chunk from the voice-activity capability.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// Speech probability in `[0, 1]`.
    pub score: f32,
    pub chunk: AudioChunk,
}

/// Streaming voice-activity classification job.
pub struct VoiceProbeJob {
    pub input: mpsc::Sender<AudioChunk>,
    pub output: mpsc::Receiver<ScoredChunk>,
    pub cancel: CancellationToken,
}

/// Voice-activity classifier capability.
#[async_trait]
pub trait VoiceProbe: Send + Sync {
    /// Open a streaming classification job.
    async fn detect(&self) -> Result<VoiceProbeJob>;
}

/// An incremental transcription result.
#[derive(Debug, Clone)]
pub struct TranscriptChunk {
    pub text: String,
    /// Whether the transcriber considers this utterance complete.
    pub is_final: bool,
}

/// Streaming speech-to-text job.
pub struct TranscribeJob {
    pub input: mpsc::Sender<AudioChunk>,
    pub output: mpsc::Receiver<TranscriptChunk>,
    pub cancel: CancellationToken,
}

/// Speech-to-text capability.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a streaming transcription job.
    async fn transcribe(&self) -> Result<TranscribeJob>;
}

/// End-of-turn prediction capability.
#[async_trait]
pub trait TurnPredictor: Send + Sync {
    /// Probability in `[0, 1]` that the user has finished their turn given
    /// the conversation so far.
    async fn predict(&self, messages: &[Message]) -> Result<f32>;
}

/// One streamed unit of a model response.
#[derive(Debug, Clone)]
pub enum GenerationChunk {
    /// Assistant-visible text.
    Content { text: String },
    /// Reasoning text, never shown to the user.
    Reasoning { text: String },
    /// A structured action (tool) call.
    Action { request: ActionRequest },
    /// End of the response stream.
    End,
}

/// Inputs to one streamed model response.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ActionDefinition>,
}

/// A running streamed model response.
pub struct GenerationStream {
    pub chunks: mpsc::Receiver<GenerationChunk>,
    pub cancel: CancellationToken,
}

/// Language-model capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Open a streaming message generation.
    async fn generate_message(&self, request: GenerationRequest) -> Result<GenerationStream>;

    /// One-shot structured generation against a JSON schema.
    async fn generate_object(
        &self,
        messages: &[Message],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Streaming text-to-speech job.
pub struct SynthesisJob {
    pub input: mpsc::Sender<String>,
    pub output: mpsc::Receiver<AudioChunk>,
    pub cancel: CancellationToken,
}

/// Text-to-speech capability.
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    /// Open a streaming synthesis job.
    async fn synthesize(&self) -> Result<SynthesisJob>;
}

/// Bundle of capability handles given to the agent at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub voice_probe: std::sync::Arc<dyn VoiceProbe>,
    pub speech_to_text: std::sync::Arc<dyn SpeechToText>,
    pub turn_predictor: std::sync::Arc<dyn TurnPredictor>,
    pub language_model: std::sync::Arc<dyn LanguageModel>,
    pub speech_synthesis: std::sync::Arc<dyn SpeechSynthesis>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_duration_follows_sample_rate() {
        let chunk = AudioChunk {
            samples: vec![0.0; 1600],
            sample_rate: 16_000,
        };
        assert_eq!(chunk.duration_ms(), 100);
    }

    #[test]
    fn zero_sample_rate_has_zero_duration() {
        let chunk = AudioChunk {
            samples: vec![0.0; 512],
            sample_rate: 0,
        };
        assert_eq!(chunk.duration_ms(), 0);
    }
}
