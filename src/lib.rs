//! Buddy: real-time voice dialogue orchestration core.
//!
//! Turns a wake word, push-to-talk press or typed message into a spoken and
//! text response under a strict latency budget:
//! Device frames → wake word / VAD → STT → NLU → skill → TTS → device
//!
//! # Architecture
//!
//! - **Orchestrator** (`pipeline::coordinator`): owns the provider pools, the
//!   immutable skill table, the event bus and the session manager.
//! - **Device frontend** (`audio`): one long-lived task per connection that
//!   normalizes frames and spots the wake word.
//! - **Turn controller** (`pipeline::controller`): one task per session
//!   driving the turn state machine, cancellation and barge-in.
//! - **Providers** (`stt`, `tts`, `nlu`, `wakeword`): pluggable trait objects
//!   behind bounded worker pools with fallback.
//! - **Skills** (`skills`): deadline-bounded capability calls with late
//!   result delivery.

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod host;
pub mod nlu;
pub mod pipeline;
pub mod runtime;
pub mod scripted;
pub mod skills;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wakeword;

pub use config::BuddyConfig;
pub use error::{BuddyError, ErrorKind, Result};
pub use pipeline::coordinator::{DeviceConnection, Orchestrator, Providers};
pub use runtime::RuntimeEvent;
