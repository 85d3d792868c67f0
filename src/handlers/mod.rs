//! Built-in pipeline handlers.
//!
//! Block handlers (serial, context-mutating): status, transcript,
//! agent-output. Stream handlers (concurrent, read-only): vad,
//! transcribe, end-of-turn, generation.

pub mod agent_output;
pub mod generation;
pub mod status;
pub mod transcribe;
pub mod transcript;
pub mod turn;
pub mod vad;

pub use agent_output::AgentOutputHandler;
pub use generation::GenerationHandler;
pub use status::StatusHandler;
pub use transcribe::TranscribeHandler;
pub use transcript::TranscriptHandler;
pub use turn::TurnHandler;
pub use vad::VadHandler;
