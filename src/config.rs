//! Configuration types for the agent runtime.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one agent instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Transport/room settings.
    pub transport: TransportConfig,
    /// Event bus settings.
    pub events: EventBusConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// End-of-turn prediction settings.
    pub turn: TurnConfig,
    /// Generation orchestration settings.
    pub generation: GenerationConfig,
    /// Telemetry (tracing) settings.
    pub telemetry: TelemetryConfig,
}

/// Transport/room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Room name to join on start.
    pub room: String,
    /// Join token (empty for transports that do not authenticate).
    pub token: String,
    /// Topic used for outgoing text streaming.
    pub text_topic: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            room: "default".to_owned(),
            token: String::new(),
            text_topic: "agent-text".to_owned(),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Capacity of the event history ring buffer (entries).
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 256,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Classifier score at or above which silence flips to speech.
    pub score_in_threshold: f32,
    /// Classifier score below which active speech flips back to silence.
    ///
    /// Lower than `score_in_threshold` so a score hovering between the two
    /// never flickers the activity state.
    pub score_out_threshold: f32,
    /// Chunks of leading audio replayed when speech starts, so the first
    /// syllable is not clipped.
    pub pre_padding_chunks: usize,
    /// Trailing silent chunks emitted after speech stops, before the
    /// voice-end boundary.
    pub post_padding_chunks: usize,
    /// Accumulated speech duration within the sliding window required to
    /// interrupt the agent mid-utterance.
    pub min_interruption_ms: u64,
    /// Bound on the interrupt replay ring (chunks).
    pub interrupt_buffer_chunks: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            score_in_threshold: 0.5,
            score_out_threshold: 0.25,
            pre_padding_chunks: 8,
            post_padding_chunks: 12,
            min_interruption_ms: 450,
            interrupt_buffer_chunks: 64,
        }
    }
}

/// End-of-turn prediction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Probability at or above which the turn ends immediately.
    pub threshold: f32,
    /// Lower bound on the scheduled reply delay in ms.
    pub min_timeout_ms: u64,
    /// Upper bound on the scheduled reply delay in ms.
    pub max_timeout_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            min_timeout_ms: 250,
            max_timeout_ms: 4000,
        }
    }
}

/// Generation orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of history messages sent to the model.
    pub max_history_messages: usize,
    /// Number of recent messages shown to the decide question.
    pub decide_history_messages: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_history_messages: 64,
            decide_history_messages: 8,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default tracing filter when `RUST_LOG` is unset (e.g. `"info"`).
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AgentError::Validation(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| AgentError::Validation(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints. Called once at agent construction;
    /// a failure here is fatal.
    ///
    /// # Errors
    ///
    /// Returns `Validation` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.events.history_capacity == 0 {
            return Err(AgentError::Validation(
                "events.history_capacity must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("vad.score_in_threshold", self.vad.score_in_threshold),
            ("vad.score_out_threshold", self.vad.score_out_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::Validation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.vad.score_out_threshold >= self.vad.score_in_threshold {
            return Err(AgentError::Validation(format!(
                "vad.score_out_threshold ({}) must be below vad.score_in_threshold ({})",
                self.vad.score_out_threshold, self.vad.score_in_threshold
            )));
        }
        if self.vad.min_interruption_ms == 0 {
            return Err(AgentError::Validation(
                "vad.min_interruption_ms must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.turn.threshold) || self.turn.threshold == 0.0 {
            return Err(AgentError::Validation(format!(
                "turn.threshold must be within (0, 1], got {}",
                self.turn.threshold
            )));
        }
        if self.turn.min_timeout_ms > self.turn.max_timeout_ms {
            return Err(AgentError::Validation(format!(
                "turn.min_timeout_ms ({}) exceeds turn.max_timeout_ms ({})",
                self.turn.min_timeout_ms, self.turn.max_timeout_ms
            )));
        }
        if self.generation.max_history_messages == 0 {
            return Err(AgentError::Validation(
                "generation.max_history_messages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
