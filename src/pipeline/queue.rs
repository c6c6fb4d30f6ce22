//! Bounded queue for text messages received while a response is playing.

use crate::config::{PendingDropPolicy, TurnConfig};
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueAction {
    Enqueued,
    DroppedOldest,
    DroppedIncoming,
}

/// FIFO of typed messages waiting for the session to return to idle.
#[derive(Debug)]
pub struct PendingInputQueue {
    max_pending: usize,
    drop_policy: PendingDropPolicy,
    pending: VecDeque<String>,
}

impl PendingInputQueue {
    #[must_use]
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            max_pending: config.max_pending_inputs,
            drop_policy: config.pending_drop_policy,
            pending: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything queued; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    /// Queue a message, applying the drop policy when full. Logs drops.
    pub fn enqueue(&mut self, text: String) -> EnqueueAction {
        let action = self.push(text);
        match action {
            EnqueueAction::Enqueued => {}
            EnqueueAction::DroppedOldest => {
                warn!(pending = self.len(), "pending-input queue full, dropped oldest entry");
            }
            EnqueueAction::DroppedIncoming => {
                warn!(pending = self.len(), "pending-input queue full, dropped incoming entry");
            }
        }
        action
    }

    fn push(&mut self, text: String) -> EnqueueAction {
        if text.trim().is_empty() || self.max_pending == 0 {
            return EnqueueAction::DroppedIncoming;
        }
        if self.pending.len() < self.max_pending {
            self.pending.push_back(text);
            return EnqueueAction::Enqueued;
        }
        match self.drop_policy {
            PendingDropPolicy::Oldest => {
                let _ = self.pending.pop_front();
                self.pending.push_back(text);
                EnqueueAction::DroppedOldest
            }
            PendingDropPolicy::Incoming => EnqueueAction::DroppedIncoming,
        }
    }

    pub fn dequeue(&mut self) -> Option<String> {
        self.pending.pop_front()
    }
}
