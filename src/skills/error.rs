//! Error types returned by skills.

/// Why a skill call did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkillFailure {
    /// The skill ran and reported an error.
    #[error("skill failed: {0}")]
    Failed(String),

    /// The intent lacked a slot the skill needs.
    #[error("missing slot: {slot}")]
    MissingSlot {
        /// Name of the missing slot.
        slot: String,
    },

    /// The skill observed cancellation and stopped.
    #[error("skill cancelled")]
    Cancelled,
}
