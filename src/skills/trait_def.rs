//! The [`Skill`] trait and the immutable [`SkillTable`] that routes intents.
//!
//! Skills are trait objects with a static descriptor. The table is built
//! once at startup and shared read-only; there is no runtime registration.

use super::error::SkillFailure;
use crate::pipeline::messages::{Intent, SessionId, TurnId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Static description of a skill.
#[derive(Debug, Clone, Serialize)]
pub struct SkillDescriptor {
    /// Unique machine-readable identifier (e.g. `"weather"`).
    pub name: String,
    /// Short human-readable description.
    pub description: String,
    /// Intent names this skill answers.
    pub intents: Vec<String>,
    pub category: String,
    pub tags: Vec<String>,
    /// Deadline override; the dispatcher default applies when `None`.
    pub timeout_ms: Option<u64>,
    /// Safe to call again after a failure.
    pub idempotent: bool,
}

impl SkillDescriptor {
    /// Descriptor handling a single intent of the same name.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            intents: vec![name.clone()],
            name,
            description: description.into(),
            category: "general".to_owned(),
            tags: Vec::new(),
            timeout_ms: None,
            idempotent: false,
        }
    }

    #[must_use]
    pub fn with_intents(mut self, intents: &[&str]) -> Self {
        self.intents = intents.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Case-insensitive match against name, description and tags.
    #[must_use]
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.name.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&query))
    }
}

/// Per-call context handed to a skill.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    /// When the dispatcher stops waiting.
    pub deadline: Instant,
    /// Fires when the turn is cancelled or the late-result window closes.
    pub cancel: CancellationToken,
}

/// What a skill answered.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillOutput {
    /// Text to speak to the user.
    pub text: String,
    /// Structured payload for clients.
    pub data: serde_json::Value,
}

impl SkillOutput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// A capability invoked for a resolved intent.
///
/// Skills should watch `ctx.cancel` and return promptly once it fires, but
/// the dispatcher enforces the deadline whether or not they do.
#[async_trait]
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &SkillDescriptor;

    async fn invoke(
        &self,
        intent: &Intent,
        ctx: SkillContext,
    ) -> std::result::Result<SkillOutput, SkillFailure>;
}

/// Immutable intent → skill routing table.
#[derive(Clone, Default)]
pub struct SkillTable {
    skills: Vec<Arc<dyn Skill>>,
    by_intent: HashMap<String, usize>,
}

impl std::fmt::Debug for SkillTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillTable")
            .field(
                "skills",
                &self
                    .skills
                    .iter()
                    .map(|s| s.descriptor().name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SkillTable {
    /// Build the table. Later skills do not override earlier ones for the
    /// same intent.
    #[must_use]
    pub fn new(skills: Vec<Arc<dyn Skill>>) -> Self {
        let mut by_intent = HashMap::new();
        for (idx, skill) in skills.iter().enumerate() {
            for intent in &skill.descriptor().intents {
                by_intent.entry(intent.clone()).or_insert(idx);
            }
        }
        Self { skills, by_intent }
    }

    /// Skill that answers `intent`.
    #[must_use]
    pub fn route(&self, intent: &str) -> Option<Arc<dyn Skill>> {
        self.by_intent
            .get(intent)
            .and_then(|&idx| self.skills.get(idx))
            .cloned()
    }

    /// Look up a skill by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills
            .iter()
            .find(|s| s.descriptor().name == name)
            .cloned()
    }

    /// All descriptors, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&SkillDescriptor> {
        self.skills.iter().map(|s| s.descriptor()).collect()
    }

    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<&SkillDescriptor> {
        self.skills
            .iter()
            .map(|s| s.descriptor())
            .filter(|d| d.category == category)
            .collect()
    }

    /// Search names, descriptions and tags.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&SkillDescriptor> {
        self.skills
            .iter()
            .map(|s| s.descriptor())
            .filter(|d| d.matches_query(query))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
