//! Turn states, the transition table, and finalized turn records.

use crate::error::ErrorKind;
use crate::pipeline::messages::{Intent, SessionId, TriggerKind, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// State of a session's turn controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Transcribing,
    Understanding,
    DispatchingSkill,
    Synthesizing,
    Speaking,
    Cancelled,
}

impl TurnState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Cancelled` is reachable from every non-idle state and always leads
    /// back to `Listening` (barge-in) or `Idle` (expiry, shutdown).
    #[must_use]
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Idle, Listening) => true,
            (Listening, Transcribing) => true,
            // text turns and listen timeouts
            (Listening, Understanding) | (Listening, Idle) => true,
            (Transcribing, Understanding) => true,
            // empty final transcript
            (Transcribing, Listening) => true,
            (Understanding, DispatchingSkill) => true,
            // clarification loop
            (Understanding, Listening) => true,
            // terminal fallback utterances
            (Understanding, Synthesizing) | (Transcribing, Synthesizing) => true,
            (DispatchingSkill, Synthesizing) => true,
            (Synthesizing, Speaking) => true,
            // text-only degrade and synthesis failure
            (Synthesizing, Idle) => true,
            (Speaking, Idle) => true,
            // re-listen after a clarification prompt
            (Synthesizing, Listening) | (Speaking, Listening) => true,
            (Cancelled, Listening) | (Cancelled, Idle) => true,
            (from, Cancelled) => from != Idle && from != Cancelled,
            _ => false,
        }
    }

    /// Whether a turn is in flight in this state.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, TurnState::Idle)
    }

    /// Whether a wake/push-to-talk trigger in this state interrupts the turn.
    #[must_use]
    pub fn is_barge_in_target(self) -> bool {
        !matches!(self, TurnState::Idle | TurnState::Listening)
    }

    /// Whether a typed message in this state is queued instead of interrupting.
    #[must_use]
    pub fn is_idle_adjacent(self) -> bool {
        matches!(self, TurnState::Synthesizing | TurnState::Speaking)
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Understanding => "understanding",
            Self::DispatchingSkill => "dispatching_skill",
            Self::Synthesizing => "synthesizing",
            Self::Speaking => "speaking",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Pipeline milestones, as offsets from the turn trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub speech_start_ms: Option<u64>,
    pub speech_end_ms: Option<u64>,
    pub first_partial_ms: Option<u64>,
    pub final_transcript_ms: Option<u64>,
    pub intent_ms: Option<u64>,
    pub skill_started_ms: Option<u64>,
    pub skill_finished_ms: Option<u64>,
    pub synthesis_started_ms: Option<u64>,
    pub first_audio_ms: Option<u64>,
    pub completed_ms: Option<u64>,
}

/// Milestone names for [`TurnClock::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SpeechStart,
    SpeechEnd,
    FirstPartial,
    FinalTranscript,
    Intent,
    SkillStarted,
    SkillFinished,
    SynthesisStarted,
    FirstAudio,
    Completed,
}

/// Latency clock of one turn. Milestones are write-once.
#[derive(Debug, Clone)]
pub struct TurnClock {
    started: Instant,
    started_wall: DateTime<Utc>,
    stamps: StageTimestamps,
}

impl TurnClock {
    /// Start the clock now.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_wall: Utc::now(),
            stamps: StageTimestamps::default(),
        }
    }

    /// Time since the trigger.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Instant the turn was triggered.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Record a milestone unless it was already recorded.
    pub fn mark(&mut self, stage: Stage) {
        let ms = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        let slot = match stage {
            Stage::SpeechStart => &mut self.stamps.speech_start_ms,
            Stage::SpeechEnd => &mut self.stamps.speech_end_ms,
            Stage::FirstPartial => &mut self.stamps.first_partial_ms,
            Stage::FinalTranscript => &mut self.stamps.final_transcript_ms,
            Stage::Intent => &mut self.stamps.intent_ms,
            Stage::SkillStarted => &mut self.stamps.skill_started_ms,
            Stage::SkillFinished => &mut self.stamps.skill_finished_ms,
            Stage::SynthesisStarted => &mut self.stamps.synthesis_started_ms,
            Stage::FirstAudio => &mut self.stamps.first_audio_ms,
            Stage::Completed => &mut self.stamps.completed_ms,
        };
        if slot.is_none() {
            *slot = Some(ms);
        }
    }

    /// Milestones recorded so far.
    #[must_use]
    pub fn stamps(&self) -> &StageTimestamps {
        &self.stamps
    }
}

/// The finalized, immutable record of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub utterance: Option<String>,
    pub intent: Option<Intent>,
    pub response: Option<String>,
    pub stage_timestamps: StageTimestamps,
    pub status: TurnStatus,
    pub error_kind: Option<ErrorKind>,
    pub clarification_rounds: u32,
    /// Response was delivered as text only because synthesis was unavailable.
    pub degraded: bool,
    pub latency_ms: u64,
}

/// Mutable draft of a [`TurnRecord`] while the turn is running.
///
/// `finish` consumes the draft, so a record is written exactly once.
#[derive(Debug)]
pub struct TurnDraft {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub trigger: TriggerKind,
    pub clock: TurnClock,
    pub utterance: Option<String>,
    pub intent: Option<Intent>,
    pub response: Option<String>,
    pub clarification_rounds: u32,
    pub degraded: bool,
}

impl TurnDraft {
    /// Start a draft and its latency clock.
    #[must_use]
    pub fn new(session_id: SessionId, trigger: TriggerKind) -> Self {
        Self {
            turn_id: TurnId::new(),
            session_id,
            trigger,
            clock: TurnClock::start(),
            utterance: None,
            intent: None,
            response: None,
            clarification_rounds: 0,
            degraded: false,
        }
    }

    /// Seal the draft into an immutable record.
    #[must_use]
    pub fn finish(mut self, status: TurnStatus, error_kind: Option<ErrorKind>) -> TurnRecord {
        self.clock.mark(Stage::Completed);
        TurnRecord {
            turn_id: self.turn_id,
            session_id: self.session_id,
            trigger: self.trigger,
            started_at: self.clock.started_wall,
            utterance: self.utterance,
            intent: self.intent,
            response: self.response,
            latency_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            stage_timestamps: self.clock.stamps,
            status,
            error_kind,
            clarification_rounds: self.clarification_rounds,
            degraded: self.degraded,
        }
    }
}
