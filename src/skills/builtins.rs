//! Built-in demo skills for the host bridge.

use super::error::SkillFailure;
use super::trait_def::{Skill, SkillContext, SkillDescriptor, SkillOutput};
use crate::pipeline::messages::Intent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Answers greetings.
pub struct GreetingSkill {
    descriptor: SkillDescriptor,
}

impl Default for GreetingSkill {
    fn default() -> Self {
        Self {
            descriptor: SkillDescriptor::new("greeting", "Responds to hello and good morning")
                .with_intents(&["greeting", "status"])
                .with_category("social")
                .with_tags(&["hello", "small talk"])
                .with_timeout(Duration::from_millis(500))
                .idempotent(),
        }
    }
}

#[async_trait]
impl Skill for GreetingSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        intent: &Intent,
        _ctx: SkillContext,
    ) -> std::result::Result<SkillOutput, SkillFailure> {
        let text = if intent.name == "status" {
            "All systems are running normally."
        } else {
            "Hello! How can I help?"
        };
        Ok(SkillOutput::text(text))
    }
}

/// Tells the local time.
pub struct TimeSkill {
    descriptor: SkillDescriptor,
}

impl Default for TimeSkill {
    fn default() -> Self {
        Self {
            descriptor: SkillDescriptor::new("time", "Tells the current local time")
                .with_category("information")
                .with_tags(&["clock"])
                .with_timeout(Duration::from_millis(500))
                .idempotent(),
        }
    }
}

#[async_trait]
impl Skill for TimeSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        _intent: &Intent,
        _ctx: SkillContext,
    ) -> std::result::Result<SkillOutput, SkillFailure> {
        let now = chrono::Local::now();
        Ok(SkillOutput {
            text: format!("It's {}.", now.format("%-I:%M %p")),
            data: serde_json::json!({ "iso": now.to_rfc3339() }),
        })
    }
}

/// All built-in skills.
#[must_use]
pub fn builtin_skills() -> Vec<Arc<dyn Skill>> {
    vec![
        Arc::new(GreetingSkill::default()),
        Arc::new(TimeSkill::default()),
    ]
}
