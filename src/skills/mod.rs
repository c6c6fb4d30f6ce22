//! Skills: capability trait objects, the routing table and the dispatcher.
//!
//! The [`SkillTable`] is built once at startup and injected into the
//! [`SkillDispatcher`]; nothing registers skills at runtime.

pub mod builtins;
pub mod dispatcher;
pub mod error;
pub mod trait_def;

pub use dispatcher::{
    InvocationRequest, InvocationStatus, SkillDispatcher, SkillInvocation, SkillOutcome, SkillStats,
};
pub use error::SkillFailure;
pub use trait_def::{Skill, SkillContext, SkillDescriptor, SkillOutput, SkillTable};
