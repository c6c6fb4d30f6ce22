//! Turn latency harness over simulated text sessions.
//!
//! Drives `sessions` concurrent text clients through the real orchestrator
//! with scripted providers and reports end-to-end turn latency percentiles.

use crate::config::BuddyConfig;
use crate::error::{BuddyError, Result};
use crate::pipeline::coordinator::{Orchestrator, Providers};
use crate::pipeline::messages::{ClientPayload, DeviceInput};
use crate::pipeline::turn::{TurnState, TurnStatus};
use crate::scripted::{ScriptedClassifier, ScriptedSkill, ScriptedTranscriber, ToneSynthesizer};
use crate::skills::{Skill, SkillDescriptor, SkillTable};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Benchmark configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    /// Concurrent simulated sessions.
    pub sessions: usize,
    /// Text turns each session runs back to back.
    pub turns_per_session: usize,
    /// Simulated skill work per turn.
    pub skill_delay: Duration,
    /// Synthesized frames per response, paced at the audio frame duration.
    pub response_frames: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            sessions: 8,
            turns_per_session: 10,
            skill_delay: Duration::from_millis(300),
            response_frames: 10,
        }
    }
}

/// Summary statistics for a benchmark scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchReport {
    pub scenario: String,
    pub samples: usize,
    pub sessions: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    /// Configured full-turn budget.
    pub budget_ms: u64,
    /// Turns whose latency exceeded the budget.
    pub over_budget: usize,
    /// Turns that did not end `Succeeded`.
    pub failed: usize,
}

const BENCH_UTTERANCE: &str = "what's the weather";

/// Run the text turn benchmark against a default configuration.
pub async fn run_text_turn_bench(bench: BenchConfig) -> Result<BenchReport> {
    run_text_turn_bench_with(BuddyConfig::default(), bench).await
}

/// Run the text turn benchmark against `config`.
pub async fn run_text_turn_bench_with(config: BuddyConfig, bench: BenchConfig) -> Result<BenchReport> {
    validate_config(bench)?;

    let frame_interval = Duration::from_millis(u64::from(config.audio.frame_ms));
    let providers = Providers {
        stt: Arc::new(ScriptedTranscriber::new("bench-stt", Vec::new())),
        stt_fallback: None,
        tts: Arc::new(ToneSynthesizer::new(
            "bench-tts",
            &config.audio,
            bench.response_frames,
            frame_interval,
        )),
        tts_fallback: None,
        classifier: Arc::new(ScriptedClassifier::new(Vec::new())),
        spotter: None,
    };
    let weather: Arc<dyn Skill> = Arc::new(ScriptedSkill::new(
        SkillDescriptor::new("weather", "Simulated forecast lookup"),
        bench.skill_delay,
        "Sunny and 21 degrees.",
    ));
    let budget_ms = config.turn.turn_budget_ms;
    let orchestrator = Orchestrator::new(config, providers, SkillTable::new(vec![weather]))?;

    let mut drivers = Vec::with_capacity(bench.sessions);
    for idx in 0..bench.sessions {
        let connection = orchestrator.connect(&format!("bench-{idx}")).await?;
        drivers.push(drive_session(connection, bench.turns_per_session));
    }
    let session_ids: Vec<_> = join_all(drivers).await.into_iter().collect::<Result<_>>()?;

    let mut latencies = Vec::with_capacity(bench.sessions * bench.turns_per_session);
    let mut failed = 0;
    for session_id in session_ids {
        for record in orchestrator.manager().history(session_id).await? {
            if record.status != TurnStatus::Succeeded {
                failed += 1;
            }
            latencies.push(record.latency_ms);
        }
    }
    orchestrator.shutdown().await;

    Ok(build_report("text_turn", bench.sessions, budget_ms, failed, latencies))
}

/// Send one utterance at a time and wait for the session to go idle.
async fn drive_session(
    mut connection: crate::pipeline::coordinator::DeviceConnection,
    turns: usize,
) -> Result<crate::pipeline::messages::SessionId> {
    for _ in 0..turns {
        connection
            .input
            .send(DeviceInput::Text(BENCH_UTTERANCE.to_owned()))
            .await
            .map_err(|e| BuddyError::Channel(format!("bench session input closed: {e}")))?;
        loop {
            let Some(event) = connection.events.recv().await else {
                return Err(BuddyError::SessionExpired(connection.session_id.to_string()));
            };
            if matches!(
                event.payload,
                ClientPayload::StateChanged {
                    state: TurnState::Idle
                }
            ) {
                break;
            }
        }
    }
    Ok(connection.session_id)
}

/// Write a report as pretty JSON.
pub fn write_report(report: &BenchReport, output: &std::path::Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| BuddyError::Channel(format!("failed to serialize bench report: {e}")))?;
    std::fs::write(output, json)?;
    Ok(())
}

fn validate_config(config: BenchConfig) -> Result<()> {
    if config.sessions == 0 || config.turns_per_session == 0 {
        return Err(BuddyError::Config(
            "bench sessions and turns must be greater than zero".to_owned(),
        ));
    }
    Ok(())
}

fn build_report(
    scenario: &str,
    sessions: usize,
    budget_ms: u64,
    failed: usize,
    mut timings_ms: Vec<u64>,
) -> BenchReport {
    timings_ms.sort_unstable();
    BenchReport {
        scenario: scenario.to_owned(),
        samples: timings_ms.len(),
        sessions,
        p50_ms: percentile(&timings_ms, 50),
        p95_ms: percentile(&timings_ms, 95),
        p99_ms: percentile(&timings_ms, 99),
        max_ms: timings_ms.last().copied().unwrap_or(0),
        budget_ms,
        over_budget: timings_ms.iter().filter(|&&ms| ms > budget_ms).count(),
        failed,
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (sorted.len().saturating_sub(1) * pct) / 100;
    sorted[idx]
}
