//! Intent and entity extraction.
//!
//! Classifiers map a transcript plus the session's context slots to an
//! [`Intent`]. The turn controller may classify partial transcripts ahead of
//! the final one; [`SpeculativeIntent`] holds such a result and only lets it
//! through when the final transcript says the same thing.

mod keyword;

pub use keyword::{KeywordClassifier, LAST_INTENT_SLOT, extract_entities};

use crate::error::Result;
use crate::pipeline::messages::{Intent, Slots};
use async_trait::async_trait;

/// Maps utterances to intents.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Classify `text` given the session's current context slots.
    ///
    /// # Errors
    ///
    /// Implementations backed by remote models may fail; the controller
    /// treats a failure as an ambiguous intent.
    async fn classify(&self, text: &str, context: &Slots) -> Result<Intent>;
}

/// Canonical form used to compare partial and final transcripts.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// An intent computed from a partial transcript.
#[derive(Debug, Clone)]
pub struct SpeculativeIntent {
    normalized: String,
    intent: Intent,
}

impl SpeculativeIntent {
    #[must_use]
    pub fn new(text: &str, intent: Intent) -> Self {
        Self {
            normalized: normalize(text),
            intent,
        }
    }

    /// Whether this result was computed from `text`.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.normalized == normalize(text)
    }

    /// The intent, if it was computed from `final_text`.
    #[must_use]
    pub fn take_if_matches(self, final_text: &str) -> Option<Intent> {
        self.matches(final_text).then_some(self.intent)
    }
}
