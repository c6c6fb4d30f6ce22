//! Dialogue sessions and their registry.

pub mod manager;
pub mod session;

pub use manager::SessionManager;
pub use session::{DialogueSession, HistoryWindow, SessionSnapshot, VoiceMetrics};
