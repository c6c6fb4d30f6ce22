//! Session open, close, expiry and context carry-over.

use crate::helpers::{Device, keyword_classifier, providers, scripted_stt, table, tone_tts, weather_skill};
use buddy::config::BuddyConfig;
use buddy::error::{BuddyError, ErrorKind};
use buddy::pipeline::messages::{ClientPayload, CloseReason, DeviceInput, SlotValue};
use buddy::pipeline::turn::{TurnState, TurnStatus};
use buddy::runtime::RuntimeEvent;
use buddy::skills::builtins::builtin_skills;
use buddy::Orchestrator;
use std::time::Duration;

fn orchestrator(config: BuddyConfig, tts_frames: usize, skill_delay: Duration) -> Orchestrator {
    let tts = tone_tts(&config, tts_frames);
    let mut skills = builtin_skills();
    skills.push(weather_skill(skill_delay));
    Orchestrator::new(
        config,
        providers(scripted_stt(Vec::new()), tts, keyword_classifier()),
        table(skills),
    )
    .expect("valid orchestrator")
}

fn closed_reason(dev: &Device) -> Option<CloseReason> {
    dev.log.iter().find_map(|e| match &e.payload {
        ClientPayload::SessionClosed { reason } => Some(reason.clone()),
        _ => None,
    })
}

async fn wait_closed(dev: &mut Device) -> CloseReason {
    dev.wait_for("session closed", |e| {
        matches!(e.payload, ClientPayload::SessionClosed { .. })
    })
    .await;
    closed_reason(dev).expect("close reason")
}

// ─── Expiry ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_idle_session_times_out() {
    let mut config = BuddyConfig::default();
    config.session.idle_timeout_secs = 30;
    let orch = orchestrator(config, 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "lounge").await;

    dev.text("hello").await;
    dev.wait_state(TurnState::Idle).await;
    let reason = wait_closed(&mut dev).await;
    assert_eq!(reason, CloseReason::IdleTimeout);

    assert!(dev.next().await.is_none(), "events after close: {:?}", dev.names());
    assert!(matches!(
        orch.manager().history(dev.conn.session_id).await,
        Err(BuddyError::SessionExpired(_))
    ));
    assert!(orch.manager().session_for_channel("lounge").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_quiet_audio_does_not_keep_session_alive() {
    let mut config = BuddyConfig::default();
    config.session.idle_timeout_secs = 2;
    let orch = orchestrator(config, 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "lounge").await;

    // Room tone right up to the timeout, then nothing.
    dev.frames(0.0, 95).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    dev.drain();
    assert_eq!(closed_reason(&dev), Some(CloseReason::IdleTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_expire_during_turn_records_cancellation() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_secs(2));
    let mut dev = Device::connect(&orch, "bedroom").await;
    let session_id = dev.conn.session_id;

    dev.text("what's the weather").await;
    dev.wait_state(TurnState::DispatchingSkill).await;
    orch.manager().expire(session_id).await.unwrap();

    let reason = wait_closed(&mut dev).await;
    assert_eq!(reason, CloseReason::Expired);
    assert!(dev.states().contains(&TurnState::Cancelled));

    let record = orch
        .bus()
        .history(Some(session_id), 1000)
        .into_iter()
        .find_map(|e| match e {
            RuntimeEvent::TurnCompleted(record) => Some(record),
            _ => None,
        })
        .expect("turn record");
    assert_eq!(record.status, TurnStatus::Cancelled);
    assert_eq!(record.error_kind, Some(ErrorKind::SessionExpired));
    assert!(matches!(
        orch.manager().expire(session_id).await,
        Err(BuddyError::SessionExpired(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_expire_returns_after_session_is_closed() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_secs(2));
    let mut dev = Device::connect(&orch, "guest room").await;
    let session_id = dev.conn.session_id;

    dev.text("what's the weather").await;
    dev.wait_state(TurnState::DispatchingSkill).await;
    orch.manager().expire(session_id).await.unwrap();

    // Everything the close produces is already out when expire returns.
    dev.drain();
    assert_eq!(closed_reason(&dev), Some(CloseReason::Expired));
    assert!(
        orch.bus()
            .history(Some(session_id), 1000)
            .iter()
            .any(|e| matches!(e, RuntimeEvent::TurnCompleted(_)))
    );
    assert!(!orch.manager().active_sessions().contains(&session_id));
}

#[tokio::test(start_paused = true)]
async fn test_capture_error_closes_session() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "nursery").await;

    dev.send(DeviceInput::PushToTalk).await;
    dev.wait_state(TurnState::Listening).await;
    dev.send(DeviceInput::CaptureError("mic unplugged".into()))
        .await;

    let reason = wait_closed(&mut dev).await;
    assert_eq!(reason, CloseReason::CaptureError("mic unplugged".into()));
    let failed = orch
        .bus()
        .history(Some(dev.conn.session_id), 1000)
        .into_iter()
        .any(|e| match e {
            RuntimeEvent::TurnCompleted(record) => {
                record.status == TurnStatus::Failed && record.error_kind == Some(ErrorKind::CaptureError)
            }
            _ => false,
        });
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_device_disconnect_ends_session() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "porch").await;

    dev.send(DeviceInput::Disconnect).await;
    let reason = wait_closed(&mut dev).await;
    assert_eq!(reason, CloseReason::Disconnected);
    assert!(orch.manager().active_sessions().is_empty());
}

// ─── Reconnect ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_live_session() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let first = Device::connect(&orch, "kitchen").await;
    let session_id = first.conn.session_id;

    let mut second = Device::connect(&orch, "kitchen").await;
    assert_eq!(second.conn.session_id, session_id);
    drop(first);

    second.text("hello").await;
    second.wait_state(TurnState::Idle).await;
    assert_eq!(second.history(&orch).await.len(), 1);
    assert_eq!(orch.manager().active_sessions(), vec![session_id]);
}

#[tokio::test(start_paused = true)]
async fn test_channel_gets_fresh_session_after_close() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "kitchen").await;
    let old = dev.conn.session_id;
    dev.text("hello").await;
    dev.wait_state(TurnState::Idle).await;
    orch.manager().expire(old).await.unwrap();

    let mut again = Device::connect(&orch, "kitchen").await;
    assert_ne!(again.conn.session_id, old);
    again.wait_for("session start", |e| matches!(e.payload, ClientPayload::SessionStarted)).await;
    assert!(again.history(&orch).await.is_empty());
}

// ─── Dialogue context ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_context_carries_last_intent_and_slots() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "kitchen").await;

    dev.text("what's the weather in Paris").await;
    dev.wait_state(TurnState::Idle).await;
    let context = orch.manager().get_context(dev.conn.session_id).await.unwrap();
    assert_eq!(context["city"], SlotValue::Text("Paris".into()));
    assert_eq!(context["last_intent"], SlotValue::Text("weather".into()));

    // A follow-up with no keywords of its own resolves against the context.
    dev.text("and tomorrow").await;
    dev.wait_state(TurnState::Idle).await;
    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].intent.as_ref().unwrap().name, "weather");
}

#[tokio::test(start_paused = true)]
async fn test_text_while_speaking_is_queued() {
    let orch = orchestrator(BuddyConfig::default(), 40, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "kitchen").await;

    dev.text("what's the weather").await;
    dev.wait_state(TurnState::Speaking).await;
    dev.text("hello").await;
    dev.wait_state(TurnState::Idle).await;
    dev.wait_state(TurnState::Idle).await;

    assert!(!dev.log.iter().any(|e| matches!(e.payload, ClientPayload::BargeIn { .. })));
    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == TurnStatus::Succeeded));
    assert_eq!(history[1].utterance.as_deref(), Some("hello"));
    assert_eq!(history[1].intent.as_ref().unwrap().name, "greeting");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_tracks_metrics() {
    let orch = orchestrator(BuddyConfig::default(), 3, Duration::from_millis(10));
    let mut dev = Device::connect(&orch, "kitchen").await;
    dev.text("hello").await;
    dev.wait_state(TurnState::Idle).await;
    dev.text("what time is it").await;
    dev.wait_state(TurnState::Idle).await;

    let snapshot = orch.manager().snapshot(dev.conn.session_id).await.unwrap();
    assert_eq!(snapshot.channel, "kitchen");
    assert_eq!(snapshot.state, TurnState::Idle);
    assert_eq!(snapshot.history_len, 2);
    assert_eq!(snapshot.metrics.text_inputs, 2);
    assert_eq!(snapshot.metrics.turns_succeeded, 2);
}
