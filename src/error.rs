//! Error types for the buddy dialogue core.

use serde::{Deserialize, Serialize};

/// Classification of a turn or session failure.
///
/// Recorded on every failed [`TurnRecord`](crate::pipeline::turn::TurnRecord)
/// so failures can be analysed after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Device or microphone unavailable. Session-fatal.
    CaptureError,
    /// Speech-to-text failed on both the primary and the fallback provider.
    TranscriptionError,
    /// Intent confidence stayed below threshold after all clarification rounds.
    IntentAmbiguous,
    /// Skill did not answer before its deadline.
    SkillTimeout,
    /// Skill returned an error, or no skill handles the intent.
    SkillError,
    /// Text-to-speech failed on both the primary and the fallback provider.
    SynthesisError,
    /// Session expired (idle timeout or explicit expiry) while a turn was active.
    SessionExpired,
    /// A shared provider pool rejected the work after the admission wait.
    Overloaded,
}

impl ErrorKind {
    /// Stable snake_case name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaptureError => "capture_error",
            Self::TranscriptionError => "transcription_error",
            Self::IntentAmbiguous => "intent_ambiguous",
            Self::SkillTimeout => "skill_timeout",
            Self::SkillError => "skill_error",
            Self::SynthesisError => "synthesis_error",
            Self::SessionExpired => "session_expired",
            Self::Overloaded => "overloaded",
        }
    }

    /// Whether this failure ends the session rather than just the turn.
    #[must_use]
    pub fn is_session_fatal(self) -> bool {
        matches!(self, Self::CaptureError | Self::SessionExpired)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the dialogue core.
#[derive(Debug, thiserror::Error)]
pub enum BuddyError {
    /// Audio device or capture stream error.
    #[error("capture error: {0}")]
    Capture(String),

    /// Speech-to-text transcription error.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Intent could not be resolved with enough confidence.
    #[error("intent ambiguous: {0}")]
    IntentAmbiguous(String),

    /// Skill invocation exceeded its deadline.
    #[error("skill timed out after {timeout_ms}ms")]
    SkillTimeout {
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// Skill invocation error.
    #[error("skill error: {0}")]
    Skill(String),

    /// Text-to-speech synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// The addressed session no longer exists.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// A shared worker pool is saturated.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Malformed host bridge command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuddyError {
    /// Map to the failure taxonomy, if this is a dialogue-level failure.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Capture(_) => Some(ErrorKind::CaptureError),
            Self::Transcription(_) => Some(ErrorKind::TranscriptionError),
            Self::IntentAmbiguous(_) => Some(ErrorKind::IntentAmbiguous),
            Self::SkillTimeout { .. } => Some(ErrorKind::SkillTimeout),
            Self::Skill(_) => Some(ErrorKind::SkillError),
            Self::Synthesis(_) => Some(ErrorKind::SynthesisError),
            Self::SessionExpired(_) => Some(ErrorKind::SessionExpired),
            Self::Overloaded(_) => Some(ErrorKind::Overloaded),
            Self::Config(_) | Self::Channel(_) | Self::InvalidCommand(_) | Self::Io(_) => None,
        }
    }
}

impl From<crate::host::contract::ContractError> for BuddyError {
    fn from(err: crate::host::contract::ContractError) -> Self {
        Self::InvalidCommand(err.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BuddyError>;
