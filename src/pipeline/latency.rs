//! Soft latency budget tracking for a single turn.
//!
//! Budgets never abort a turn. Overruns are reported once each, and the
//! whole-turn overrun additionally arms a one-shot filler utterance when it
//! happens while a skill is still running.

use crate::config::TurnConfig;
use crate::pipeline::turn::TurnClock;
use crate::runtime::LatencyBudget;
use std::time::Duration;
use tokio::time::Instant;

/// An elapsed budget, reported at most once per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetOverrun {
    pub budget: LatencyBudget,
    pub budget_ms: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LatencyTracker {
    nlu_budget: Duration,
    turn_budget: Duration,
    filler_enabled: bool,
    nlu_reported: bool,
    turn_reported: bool,
    filler_spoken: bool,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            nlu_budget: config.nlu_budget(),
            turn_budget: config.turn_budget(),
            filler_enabled: config.filler_enabled,
            nlu_reported: false,
            turn_reported: false,
            filler_spoken: false,
        }
    }

    /// Instant at which the whole-turn budget elapses.
    #[must_use]
    pub fn turn_deadline(&self, clock: &TurnClock) -> Instant {
        clock.started_at() + self.turn_budget
    }

    /// Check the trigger-to-intent budget when the final intent is known.
    pub fn check_nlu(&mut self, clock: &TurnClock) -> Option<BudgetOverrun> {
        if self.nlu_reported {
            return None;
        }
        let elapsed = clock.elapsed();
        if elapsed <= self.nlu_budget {
            return None;
        }
        self.nlu_reported = true;
        Some(overrun(LatencyBudget::Nlu, self.nlu_budget, elapsed))
    }

    /// Check the whole-turn budget.
    pub fn check_turn(&mut self, clock: &TurnClock) -> Option<BudgetOverrun> {
        if self.turn_reported {
            return None;
        }
        let elapsed = clock.elapsed();
        if elapsed < self.turn_budget {
            return None;
        }
        self.turn_reported = true;
        Some(overrun(LatencyBudget::Turn, self.turn_budget, elapsed))
    }

    /// Whether the whole-turn overrun has yet to be reported.
    #[must_use]
    pub fn turn_budget_pending(&self) -> bool {
        !self.turn_reported
    }

    /// Claim the filler utterance. Returns `true` only the first time.
    pub fn take_filler(&mut self) -> bool {
        if !self.filler_enabled || self.filler_spoken {
            return false;
        }
        self.filler_spoken = true;
        true
    }
}

fn overrun(budget: LatencyBudget, limit: Duration, elapsed: Duration) -> BudgetOverrun {
    BudgetOverrun {
        budget,
        budget_ms: millis(limit),
        elapsed_ms: millis(elapsed),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
