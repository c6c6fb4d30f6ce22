//! Runtime events emitted by the orchestrator for observability.
//!
//! These are deliberately small (no audio payloads) so sessions can emit
//! them without slowing the audio path. Client-facing output goes through
//! per-session channels instead; see [`crate::pipeline::bus`].

use crate::error::ErrorKind;
use crate::pipeline::messages::{CloseReason, SessionId, TurnId};
use crate::pipeline::turn::{TurnRecord, TurnState};
use serde::Serialize;

/// Which soft latency budget was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyBudget {
    /// Trigger to final intent.
    Nlu,
    /// Trigger to turn completion.
    Turn,
}

/// Events that describe what the orchestrator is doing "right now".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    SessionOpened {
        session_id: SessionId,
        channel: String,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    /// A turn controller moved between states.
    StateChanged {
        session_id: SessionId,
        turn_id: Option<TurnId>,
        from: TurnState,
        to: TurnState,
    },
    /// A soft latency budget elapsed before its milestone.
    LatencyBudgetExceeded {
        session_id: SessionId,
        turn_id: TurnId,
        budget: LatencyBudget,
        budget_ms: u64,
        elapsed_ms: u64,
    },
    /// A provider pool rejected work after the admission wait.
    PoolSaturated {
        session_id: SessionId,
        pool: &'static str,
        waited_ms: u64,
    },
    BargeIn {
        session_id: SessionId,
        cancelled: TurnId,
    },
    /// A finalized turn record.
    TurnCompleted(Box<TurnRecord>),
    /// A skill finished after its deadline.
    LateSkillResult {
        session_id: SessionId,
        turn_id: TurnId,
        skill: String,
        delivered: bool,
    },
    /// A stage failed and the turn fell back.
    StageFailed {
        session_id: SessionId,
        turn_id: TurnId,
        kind: ErrorKind,
        detail: String,
    },
}

impl RuntimeEvent {
    /// Session the event concerns.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionOpened { session_id, .. }
            | Self::SessionClosed { session_id, .. }
            | Self::StateChanged { session_id, .. }
            | Self::LatencyBudgetExceeded { session_id, .. }
            | Self::PoolSaturated { session_id, .. }
            | Self::BargeIn { session_id, .. }
            | Self::LateSkillResult { session_id, .. }
            | Self::StageFailed { session_id, .. } => *session_id,
            Self::TurnCompleted(record) => record.session_id,
        }
    }

    /// Short event name for logs and host envelopes.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "runtime.session_opened",
            Self::SessionClosed { .. } => "runtime.session_closed",
            Self::StateChanged { .. } => "runtime.state_changed",
            Self::LatencyBudgetExceeded { .. } => "runtime.latency_budget_exceeded",
            Self::PoolSaturated { .. } => "runtime.pool_saturated",
            Self::BargeIn { .. } => "runtime.barge_in",
            Self::TurnCompleted(_) => "runtime.turn_completed",
            Self::LateSkillResult { .. } => "runtime.late_skill_result",
            Self::StageFailed { .. } => "runtime.stage_failed",
        }
    }
}
