//! Provider pool admission under concurrent sessions.

use crate::helpers::{Device, keyword_classifier, providers, scripted_stt, table, tone_tts, weather_skill};
use buddy::config::BuddyConfig;
use buddy::error::ErrorKind;
use buddy::pipeline::messages::ResponseKind;
use buddy::pipeline::turn::{TurnState, TurnStatus};
use buddy::runtime::RuntimeEvent;
use buddy::scripted::SegmentScript;
use buddy::Orchestrator;
use std::time::Duration;
use tokio::time::Instant;

const DEVICES: usize = 4;

fn orchestrator(stt_pool: usize, max_queue_wait_ms: u64) -> Orchestrator {
    let mut config = BuddyConfig::default();
    config.stt.pool_size = stt_pool;
    config.stt.max_queue_wait_ms = max_queue_wait_ms;
    config.tts.pool_size = DEVICES;
    let tts = tone_tts(&config, 3);
    Orchestrator::new(
        config,
        providers(
            scripted_stt(vec![SegmentScript::says("what's the weather")]),
            tts,
            keyword_classifier(),
        ),
        table(vec![weather_skill(Duration::from_millis(100))]),
    )
    .expect("valid orchestrator")
}

/// Every device wakes and speaks at the same moment; each task returns the
/// device after its turn has ended.
async fn speak_concurrently(orch: &Orchestrator) -> Vec<(Device, Instant)> {
    let mut tasks = Vec::with_capacity(DEVICES);
    for idx in 0..DEVICES {
        let mut dev = Device::connect(orch, &format!("room-{idx}")).await;
        tasks.push(tokio::spawn(async move {
            dev.wake().await;
            let speech_started = Instant::now();
            dev.utterance().await;
            dev.wait_state(TurnState::Idle).await;
            (dev, speech_started)
        }));
    }
    let mut devices = Vec::with_capacity(DEVICES);
    for task in tasks {
        devices.push(task.await.expect("device task"));
    }
    devices
}

// ─── Saturation ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_saturated_stt_pool_rejects_within_wait_bound() {
    let orch = orchestrator(1, 300);
    let overloaded = orch.config().responses.stt_overloaded.clone();
    let devices = speak_concurrently(&orch).await;

    let mut succeeded = 0;
    let mut rejected = 0;
    for (dev, _) in &devices {
        let history = dev.history(&orch).await;
        assert_eq!(history.len(), 1, "{:?}", dev.names());
        let record = &history[0];
        match record.status {
            TurnStatus::Succeeded => succeeded += 1,
            TurnStatus::Failed => {
                assert_eq!(record.error_kind, Some(ErrorKind::Overloaded));
                assert_eq!(record.response.as_deref(), Some(overloaded.as_str()));
                assert!(record.utterance.is_none());
                rejected += 1;
            }
            TurnStatus::Cancelled => panic!("unexpected cancelled turn: {:?}", dev.names()),
        }
    }
    assert!(succeeded >= 1);
    assert!(rejected >= 1);
    assert_eq!(succeeded + rejected, DEVICES);

    let stats = orch.transcriber().pool().stats();
    assert!(stats.max_wait_ms <= 300, "{stats:?}");
    assert_eq!(stats.rejected, rejected as u64);
    assert_eq!(stats.in_use, 0);

    let saturations: Vec<_> = orch
        .bus()
        .history(None, 1000)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::PoolSaturated { pool, waited_ms, .. } => Some((pool, waited_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(saturations.len(), rejected);
    assert!(saturations.iter().all(|(pool, _)| *pool == "stt"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_session_hears_back_promptly() {
    let orch = orchestrator(1, 300);
    let config = orch.config().clone();
    let utterance_ms = u64::from(config.vad.min_speech_duration_ms + config.vad.min_silence_duration_ms);
    let devices = speak_concurrently(&orch).await;

    for (dev, speech_started) in devices {
        let rejected = dev.history(&orch).await[0].error_kind == Some(ErrorKind::Overloaded);
        if !rejected {
            continue;
        }
        // The overload response is the only response text of the turn and
        // arrives long before the user finishes talking plus a full turn.
        let responses: Vec<_> = dev
            .log
            .iter()
            .filter_map(|e| match &e.payload {
                buddy::pipeline::messages::ClientPayload::ResponseText { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![ResponseKind::Fallback]);
        assert!(
            speech_started.elapsed() < Duration::from_millis(utterance_ms + config.turn.turn_budget_ms),
            "rejected session took {:?}",
            speech_started.elapsed()
        );
    }
}

// ─── Fair admission ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_generous_wait_bound_serves_everyone() {
    let orch = orchestrator(1, 10_000);
    let devices = speak_concurrently(&orch).await;

    for (dev, _) in &devices {
        let history = dev.history(&orch).await;
        assert_eq!(history[0].status, TurnStatus::Succeeded, "{:?}", dev.names());
        assert_eq!(history[0].utterance.as_deref(), Some("what's the weather"));
    }
    let stats = orch.transcriber().pool().stats();
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.admitted, DEVICES as u64);
    assert!(stats.max_wait_ms > 0);
    assert!(stats.max_wait_ms <= 10_000);
}
