//! Per-conversation state: context slots, bounded turn history, metrics.
//!
//! A [`DialogueSession`] is owned by its session task; nothing else mutates
//! it. Other components read it through the session manager's commands.

use crate::nlu::LAST_INTENT_SLOT;
use crate::pipeline::messages::{Intent, SessionId, SlotValue, Slots, TriggerKind};
use crate::pipeline::turn::{TurnRecord, TurnState, TurnStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Turn history with fixed capacity.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    /// Records in commit order (oldest first).
    records: VecDeque<TurnRecord>,
    capacity: usize,
}

impl HistoryWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest if at capacity.
    pub fn push(&mut self, record: TurnRecord) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record.
    #[must_use]
    pub fn last(&self) -> Option<&TurnRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TurnRecord> {
        self.records.iter()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<TurnRecord> {
        self.records.iter().cloned().collect()
    }
}

/// Per-session voice interaction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoiceMetrics {
    pub wake_detections: u64,
    pub push_to_talk: u64,
    pub text_inputs: u64,
    pub turns_succeeded: u64,
    pub turns_failed: u64,
    pub turns_interrupted: u64,
    pub degraded_responses: u64,
    pub total_latency_ms: u64,
}

impl VoiceMetrics {
    pub fn record_trigger(&mut self, trigger: TriggerKind) {
        match trigger {
            TriggerKind::WakeWord => self.wake_detections += 1,
            TriggerKind::PushToTalk => self.push_to_talk += 1,
            TriggerKind::Text => self.text_inputs += 1,
        }
    }

    pub fn record_turn(&mut self, record: &TurnRecord) {
        match record.status {
            TurnStatus::Succeeded => self.turns_succeeded += 1,
            TurnStatus::Failed => self.turns_failed += 1,
            TurnStatus::Cancelled => self.turns_interrupted += 1,
        }
        if record.degraded {
            self.degraded_responses += 1;
        }
        if record.status != TurnStatus::Cancelled {
            self.total_latency_ms += record.latency_ms;
        }
    }

    /// Mean latency of completed (non-cancelled) turns.
    #[must_use]
    pub fn avg_latency_ms(&self) -> u64 {
        let completed = self.turns_succeeded + self.turns_failed;
        if completed == 0 {
            0
        } else {
            self.total_latency_ms / completed
        }
    }
}

/// Serializable view of a session for hosts and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub channel: String,
    pub state: TurnState,
    pub context: Slots,
    pub history_len: usize,
    pub metrics: VoiceMetrics,
    pub created_at: DateTime<Utc>,
    pub idle_for_ms: u64,
}

/// One conversation with one device or text channel.
#[derive(Debug)]
pub struct DialogueSession {
    pub id: SessionId,
    pub channel: String,
    pub state: TurnState,
    context: Slots,
    history: HistoryWindow,
    pub metrics: VoiceMetrics,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Instant,
}

impl DialogueSession {
    #[must_use]
    pub fn new(id: SessionId, channel: impl Into<String>, history_window: usize) -> Self {
        Self {
            id,
            channel: channel.into(),
            state: TurnState::Idle,
            context: Slots::new(),
            history: HistoryWindow::new(history_window),
            metrics: VoiceMetrics::default(),
            created_at: Utc::now(),
            last_activity_at: Instant::now(),
        }
    }

    /// Mark the session active now.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    #[must_use]
    pub fn context(&self) -> &Slots {
        &self.context
    }

    /// Merge slots into the context; newer values overwrite older ones.
    pub fn merge_context(&mut self, slots: &Slots) {
        for (key, value) in slots {
            self.context.insert(key.clone(), value.clone());
        }
    }

    /// Remember an accepted intent and its slots for follow-up turns.
    pub fn remember_intent(&mut self, intent: &Intent) {
        self.merge_context(&intent.slots);
        self.context.insert(
            LAST_INTENT_SLOT.to_owned(),
            SlotValue::Text(intent.name.clone()),
        );
    }

    /// Append a finalized turn to history.
    pub fn commit(&mut self, record: TurnRecord) {
        self.metrics.record_turn(&record);
        self.history.push(record);
        self.touch();
    }

    #[must_use]
    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            channel: self.channel.clone(),
            state: self.state,
            context: self.context.clone(),
            history_len: self.history.len(),
            metrics: self.metrics.clone(),
            created_at: self.created_at,
            idle_for_ms: u64::try_from(self.last_activity_at.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}
