//! Error types for the agent runtime.

/// Top-level error type for the conversational agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Event payload, context, or configuration shape mismatch.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced message or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A wait exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An external transport or model capability failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// I/O error (config file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything not covered by the taxonomy above.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl AgentError {
    /// Short taxonomy label for history entries and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::Io(_) => "io",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
