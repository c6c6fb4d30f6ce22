//! Skill invocation with deadlines, retries and late results.
//!
//! Every call runs in its own task so the dispatcher can stop waiting at the
//! deadline without relying on the skill to cooperate. A call that misses its
//! deadline keeps running for a grace window; if it then succeeds, the result
//! is pushed to the session as a [`ClientPayload::SkillUpdate`] tagged with
//! the original turn. Once a call has timed out it no longer belongs to the
//! turn: a later barge-in does not stop it, only the grace window or
//! dispatcher shutdown does.

use super::error::SkillFailure;
use super::trait_def::{Skill, SkillContext, SkillOutput, SkillTable};
use crate::config::SkillsConfig;
use crate::pipeline::bus::SessionEventBus;
use crate::pipeline::messages::{ClientPayload, Intent, SessionId, TurnId};
use crate::runtime::RuntimeEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillOutcome {
    Succeeded(SkillOutput),
    /// The deadline elapsed; the call may still complete late.
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    TimedOut,
    Failed,
}

/// Record of a finished dispatch.
#[derive(Debug, Clone)]
pub struct SkillInvocation {
    pub id: Uuid,
    pub skill: String,
    pub intent: Intent,
    pub turn_id: TurnId,
    pub deadline: Instant,
    /// Attempts made, including retries.
    pub attempts: u32,
    pub latency: Duration,
    pub outcome: SkillOutcome,
}

impl SkillInvocation {
    #[must_use]
    pub fn status(&self) -> InvocationStatus {
        match self.outcome {
            SkillOutcome::Succeeded(_) => InvocationStatus::Succeeded,
            SkillOutcome::TimedOut => InvocationStatus::TimedOut,
            SkillOutcome::Failed(_) => InvocationStatus::Failed,
        }
    }
}

/// What the controller asks for.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub intent: Intent,
    /// The turn's token; cancelling it before the deadline stops waiting and
    /// cancels the skill.
    pub cancel: CancellationToken,
}

/// Per-skill execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkillStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub late_completions: u64,
    pub total_latency_ms: u64,
}

impl SkillStats {
    /// Mean latency of calls that returned before their deadline.
    #[must_use]
    pub fn avg_latency_ms(&self) -> u64 {
        let answered = self.successes + self.failures;
        if answered == 0 {
            0
        } else {
            self.total_latency_ms / answered
        }
    }
}

type StatsMap = Arc<Mutex<HashMap<String, SkillStats>>>;

fn update_stats(stats: &StatsMap, skill: &str, f: impl FnOnce(&mut SkillStats)) {
    if let Ok(mut map) = stats.lock() {
        f(map.entry(skill.to_owned()).or_default());
    }
}

/// Routes intents to skills and enforces deadlines.
#[derive(Debug)]
pub struct SkillDispatcher {
    table: Arc<SkillTable>,
    bus: Arc<SessionEventBus>,
    default_deadline: Duration,
    max_retries: u32,
    late_result_grace: Duration,
    max_concurrent: usize,
    concurrency: Arc<Semaphore>,
    stats: StatsMap,
    /// Parent of every skill call's token.
    shutdown: CancellationToken,
}

impl SkillDispatcher {
    #[must_use]
    pub fn new(table: Arc<SkillTable>, bus: Arc<SessionEventBus>, config: &SkillsConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            table,
            bus,
            default_deadline: config.default_deadline(),
            max_retries: config.max_retries,
            late_result_grace: config.late_result_grace(),
            max_concurrent,
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
            stats: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel every running skill call, including timed-out ones still inside
    /// their grace window.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn table(&self) -> &Arc<SkillTable> {
        &self.table
    }

    /// Whether some skill answers `intent`.
    #[must_use]
    pub fn can_handle(&self, intent: &str) -> bool {
        self.table.route(intent).is_some()
    }

    /// Deadline for a skill: its own override or the configured default.
    #[must_use]
    pub fn deadline_for(&self, skill: &dyn Skill) -> Duration {
        skill
            .descriptor()
            .timeout_ms
            .map_or(self.default_deadline, Duration::from_millis)
    }

    /// Calls currently running, including ones past their deadline.
    #[must_use]
    pub fn active_invocations(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.concurrency.available_permits())
    }

    /// Snapshot of per-skill counters.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, SkillStats> {
        self.stats.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Invoke the skill routed for `request.intent`.
    ///
    /// Returns when the skill answers, the deadline elapses, or the turn is
    /// cancelled. Timeouts are never retried; failures of idempotent skills
    /// are retried within the remaining deadline.
    pub async fn invoke(&self, request: InvocationRequest) -> SkillInvocation {
        let started = Instant::now();
        let id = Uuid::new_v4();
        let Some(skill) = self.table.route(&request.intent.name) else {
            return SkillInvocation {
                id,
                skill: String::new(),
                deadline: started,
                attempts: 0,
                latency: Duration::ZERO,
                outcome: SkillOutcome::Failed(format!(
                    "no skill handles intent '{}'",
                    request.intent.name
                )),
                intent: request.intent,
                turn_id: request.turn_id,
            };
        };
        let name = skill.descriptor().name.clone();
        let deadline = started + self.deadline_for(skill.as_ref());

        let Ok(permit) = Arc::clone(&self.concurrency).try_acquire_owned() else {
            warn!(skill = %name, limit = self.max_concurrent, "skill concurrency limit reached");
            update_stats(&self.stats, &name, |s| {
                s.executions += 1;
                s.failures += 1;
            });
            return SkillInvocation {
                id,
                skill: name,
                intent: request.intent,
                turn_id: request.turn_id,
                deadline,
                attempts: 0,
                latency: Duration::ZERO,
                outcome: SkillOutcome::Failed("too many concurrent skill executions".to_owned()),
            };
        };

        debug!(
            skill = %name,
            session_id = %request.session_id,
            turn_id = %request.turn_id,
            invocation_id = %id,
            "invoking skill"
        );

        let skill_cancel = self.shutdown.child_token();
        // Cancels the call if this future is dropped or returns before the
        // deadline; disarmed when the call is handed to the late watcher.
        let guard = skill_cancel.clone().drop_guard();
        let ctx = SkillContext {
            session_id: request.session_id,
            turn_id: request.turn_id,
            deadline,
            cancel: skill_cancel.clone(),
        };
        let retries = if skill.descriptor().idempotent {
            self.max_retries
        } else {
            0
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let mut handle: JoinHandle<std::result::Result<SkillOutput, SkillFailure>> = {
            let skill = Arc::clone(&skill);
            let intent = request.intent.clone();
            let attempts = Arc::clone(&attempts);
            tokio::spawn(async move {
                let _permit = permit;
                run_attempts(skill, intent, ctx, retries, &attempts).await
            })
        };

        let outcome = tokio::select! {
            joined = &mut handle => joined,
            () = tokio::time::sleep_until(deadline) => {
                self.on_timeout(&name, &request, handle, guard.disarm());
                return SkillInvocation {
                    id,
                    skill: name,
                    intent: request.intent,
                    turn_id: request.turn_id,
                    deadline,
                    attempts: attempts.load(Ordering::Relaxed),
                    latency: started.elapsed(),
                    outcome: SkillOutcome::TimedOut,
                };
            }
            () = request.cancel.cancelled() => {
                drop(guard);
                handle.abort();
                debug!(skill = %name, turn_id = %request.turn_id, "skill call cancelled with turn");
                return SkillInvocation {
                    id,
                    skill: name,
                    intent: request.intent,
                    turn_id: request.turn_id,
                    deadline,
                    attempts: attempts.load(Ordering::Relaxed),
                    latency: started.elapsed(),
                    outcome: SkillOutcome::Failed(SkillFailure::Cancelled.to_string()),
                };
            }
        };
        drop(guard);

        let latency = started.elapsed();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let attempts = attempts.load(Ordering::Relaxed).max(1);
        let outcome = match outcome {
            Ok(Ok(output)) => SkillOutcome::Succeeded(output),
            Ok(Err(failure)) => SkillOutcome::Failed(failure.to_string()),
            Err(e) => SkillOutcome::Failed(format!("skill task failed: {e}")),
        };
        update_stats(&self.stats, &name, |s| {
            s.executions += 1;
            s.total_latency_ms += latency_ms;
            match outcome {
                SkillOutcome::Succeeded(_) => s.successes += 1,
                _ => s.failures += 1,
            }
        });
        if let SkillOutcome::Failed(error) = &outcome {
            warn!(skill = %name, attempts, error = %error, "skill failed");
        }

        SkillInvocation {
            id,
            skill: name,
            intent: request.intent,
            turn_id: request.turn_id,
            deadline,
            attempts,
            latency,
            outcome,
        }
    }

    /// Keep awaiting a timed-out call for the grace window and forward a late
    /// success to the session.
    ///
    /// `skill_cancel` is detached from the turn, so the result still reaches
    /// the session after a barge-in or a new turn.
    fn on_timeout(
        &self,
        name: &str,
        request: &InvocationRequest,
        handle: JoinHandle<std::result::Result<SkillOutput, SkillFailure>>,
        skill_cancel: CancellationToken,
    ) {
        info!(
            skill = %name,
            session_id = %request.session_id,
            turn_id = %request.turn_id,
            "skill deadline elapsed, awaiting late result"
        );
        update_stats(&self.stats, name, |s| {
            s.executions += 1;
            s.timeouts += 1;
        });

        let bus = Arc::clone(&self.bus);
        let stats = Arc::clone(&self.stats);
        let grace = self.late_result_grace;
        let skill = name.to_owned();
        let session_id = request.session_id;
        let turn_id = request.turn_id;
        tokio::spawn(async move {
            let mut handle = handle;
            let late = tokio::select! {
                joined = &mut handle => joined,
                () = tokio::time::sleep(grace) => {
                    skill_cancel.cancel();
                    handle.abort();
                    debug!(skill = %skill, turn_id = %turn_id, "late-result window closed");
                    return;
                }
                () = skill_cancel.cancelled() => {
                    handle.abort();
                    debug!(skill = %skill, turn_id = %turn_id, "late result dropped at shutdown");
                    return;
                }
            };
            let Ok(Ok(output)) = late else {
                debug!(skill = %skill, turn_id = %turn_id, "timed-out skill finished without a result");
                return;
            };
            update_stats(&stats, &skill, |s| s.late_completions += 1);
            let delivered = bus
                .publish_to_session(
                    session_id,
                    Some(turn_id),
                    ClientPayload::SkillUpdate {
                        skill: skill.clone(),
                        text: output.text,
                    },
                )
                .await;
            info!(skill = %skill, turn_id = %turn_id, delivered, "late skill result");
            bus.emit(RuntimeEvent::LateSkillResult {
                session_id,
                turn_id,
                skill,
                delivered,
            });
        });
    }
}

/// Call `skill` until it succeeds or runs out of retries, counting every
/// attempt in `attempts` so a caller that stops waiting still sees the count.
async fn run_attempts(
    skill: Arc<dyn Skill>,
    intent: Intent,
    ctx: SkillContext,
    retries: u32,
    attempts: &AtomicU32,
) -> std::result::Result<SkillOutput, SkillFailure> {
    loop {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match skill.invoke(&intent, ctx.clone()).await {
            Ok(output) => return Ok(output),
            Err(SkillFailure::Cancelled) => return Err(SkillFailure::Cancelled),
            Err(failure) => {
                if attempt > retries || Instant::now() >= ctx.deadline || ctx.cancel.is_cancelled() {
                    return Err(failure);
                }
                debug!(
                    skill = %skill.descriptor().name,
                    attempt,
                    error = %failure,
                    "retrying idempotent skill"
                );
            }
        }
    }
}
