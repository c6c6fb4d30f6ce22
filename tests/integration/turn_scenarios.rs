//! End-to-end turn scenarios on a paused clock.

use crate::helpers::{
    Device, WAKE_LEVEL, keyword_classifier, providers, queued_classifier, scripted_stt, table,
    tone_tts, weather_skill,
};
use buddy::config::BuddyConfig;
use buddy::error::ErrorKind;
use buddy::pipeline::messages::{
    ClientPayload, CloseReason, DeviceInput, Intent, ResponseKind, SessionId, TurnId,
};
use buddy::pipeline::turn::{TurnState, TurnStatus};
use buddy::runtime::RuntimeEvent;
use buddy::scripted::{
    ScriptedClassifier, ScriptedSkill, ScriptedTranscriber, SegmentScript, ToneSynthesizer,
};
use buddy::skills::builtins::builtin_skills;
use buddy::skills::{Skill, SkillDescriptor};
use buddy::Orchestrator;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn orchestrator(
    config: BuddyConfig,
    stt_script: Vec<SegmentScript>,
    classifier: Arc<dyn buddy::nlu::IntentClassifier>,
    tts_frames: usize,
    skills: Vec<Arc<dyn Skill>>,
) -> Orchestrator {
    let tts = tone_tts(&config, tts_frames);
    Orchestrator::new(
        config,
        providers(scripted_stt(stt_script), tts, classifier),
        table(skills),
    )
    .expect("valid orchestrator")
}

// ─── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_wake_weather_turn_succeeds_within_budget() {
    let orch = orchestrator(
        BuddyConfig::default(),
        vec![SegmentScript::says("what's the weather")],
        queued_classifier(vec![Intent::new("weather", 0.92)]),
        5,
        vec![weather_skill(Duration::from_millis(300))],
    );
    let mut dev = Device::connect(&orch, "kitchen").await;

    dev.wake().await;
    dev.utterance().await;
    let idle = dev.wait_state(TurnState::Idle).await;

    assert_eq!(
        dev.states(),
        vec![
            TurnState::Listening,
            TurnState::Transcribing,
            TurnState::Understanding,
            TurnState::DispatchingSkill,
            TurnState::Synthesizing,
            TurnState::Speaking,
            TurnState::Idle,
        ]
    );

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(Some(record.turn_id), idle.turn_id);
    assert_eq!(record.status, TurnStatus::Succeeded);
    assert_eq!(record.error_kind, None);
    assert_eq!(record.utterance.as_deref(), Some("what's the weather"));
    let intent = record.intent.as_ref().unwrap();
    assert_eq!(intent.name, "weather");
    assert!((intent.confidence - 0.92).abs() < f32::EPSILON);
    assert_eq!(record.response.as_deref(), Some("Sunny and 21 degrees."));
    assert!(record.latency_ms < 1500, "latency {}ms", record.latency_ms);
    assert!(record.stage_timestamps.first_audio_ms.is_some());

    let audio = dev
        .log
        .iter()
        .filter(|e| matches!(e.payload, ClientPayload::ResponseAudio(_)))
        .count();
    assert_eq!(audio, 5);
    assert!(
        dev.log
            .iter()
            .any(|e| matches!(&e.payload, ClientPayload::FinalTranscript { text } if text == "what's the weather"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_client_event_seq_is_gapless() {
    let orch = orchestrator(
        BuddyConfig::default(),
        Vec::new(),
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(50))],
    );
    let mut dev = Device::connect(&orch, "den").await;
    dev.text("what's the weather").await;
    dev.wait_state(TurnState::Idle).await;

    let seqs: Vec<u64> = dev.log.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert!(matches!(dev.log[0].payload, ClientPayload::SessionStarted));
}

// ─── Single active turn ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_only_one_turn_active_at_a_time() {
    let mut skills = builtin_skills();
    skills.push(weather_skill(Duration::from_secs(1)));
    let orch = orchestrator(BuddyConfig::default(), Vec::new(), keyword_classifier(), 3, skills);
    let mut dev = Device::connect(&orch, "hall").await;

    dev.text("what's the weather").await;
    dev.wait_state(TurnState::DispatchingSkill).await;
    dev.send(DeviceInput::PushToTalk).await;
    let listening = dev.wait_state(TurnState::Listening).await;
    dev.text("hello").await;
    let idle = dev.wait_state(TurnState::Idle).await;
    assert_eq!(listening.turn_id, idle.turn_id);

    // Turn ids appear in contiguous blocks: once a turn's events stop,
    // they never resume.
    let mut closed: HashSet<TurnId> = HashSet::new();
    let mut current: Option<TurnId> = None;
    for event in &dev.log {
        let Some(turn_id) = event.turn_id else {
            continue;
        };
        if current != Some(turn_id) {
            assert!(!closed.contains(&turn_id), "turn {turn_id} resumed: {:?}", dev.names());
            if let Some(previous) = current {
                closed.insert(previous);
            }
            current = Some(turn_id);
        }
    }

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, TurnStatus::Cancelled);
    assert_eq!(history[1].status, TurnStatus::Succeeded);
    assert_eq!(history[1].utterance.as_deref(), Some("hello"));
    assert_ne!(history[0].turn_id, history[1].turn_id);

    let snapshot = orch.manager().snapshot(dev.conn.session_id).await.unwrap();
    assert_eq!(snapshot.metrics.turns_interrupted, 1);
    assert_eq!(snapshot.metrics.turns_succeeded, 1);
}

// ─── Barge-in ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_wake_word_barge_in_during_speaking() {
    let orch = orchestrator(
        BuddyConfig::default(),
        Vec::new(),
        keyword_classifier(),
        100,
        vec![weather_skill(Duration::from_millis(100))],
    );
    let mut dev = Device::connect(&orch, "office").await;

    dev.text("what's the weather").await;
    let speaking = dev.wait_state(TurnState::Speaking).await;
    let old_turn = speaking.turn_id.unwrap();

    dev.frames(WAKE_LEVEL, 2).await;
    let started = Instant::now();
    dev.frames(WAKE_LEVEL, 1).await;
    let barge = dev
        .wait_for("barge-in ack", |e| matches!(e.payload, ClientPayload::BargeIn { .. }))
        .await;
    let listening = dev.wait_state(TurnState::Listening).await;
    assert!(
        started.elapsed() <= Duration::from_millis(150),
        "barge-in took {:?}",
        started.elapsed()
    );
    match barge.payload {
        ClientPayload::BargeIn { cancelled } => assert_eq!(cancelled, old_turn),
        _ => unreachable!(),
    }
    let new_turn = listening.turn_id.unwrap();
    assert_ne!(new_turn, old_turn);

    // Keep the stream flowing for a while; nothing from the old turn may
    // arrive after the acknowledgement.
    dev.frames(0.0, 50).await;
    dev.drain();
    let ack_index = dev
        .log
        .iter()
        .position(|e| matches!(e.payload, ClientPayload::BargeIn { .. }))
        .unwrap()
        + 1;
    assert!(
        dev.log[ack_index..]
            .iter()
            .all(|e| e.turn_id != Some(old_turn)),
        "stale output after barge-in: {:?}",
        dev.names()
    );

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].turn_id, old_turn);
    assert_eq!(history[0].status, TurnStatus::Cancelled);
    assert!(
        orch.bus()
            .history(Some(dev.conn.session_id), 1000)
            .iter()
            .any(|e| matches!(e, RuntimeEvent::BargeIn { cancelled, .. } if *cancelled == old_turn))
    );
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_disabled_ignores_trigger() {
    let mut config = BuddyConfig::default();
    config.turn.barge_in_enabled = false;
    let orch = orchestrator(
        config,
        Vec::new(),
        keyword_classifier(),
        20,
        vec![weather_skill(Duration::from_millis(100))],
    );
    let mut dev = Device::connect(&orch, "office").await;

    dev.text("what's the weather").await;
    dev.wait_state(TurnState::Speaking).await;
    dev.send(DeviceInput::PushToTalk).await;
    dev.wait_state(TurnState::Idle).await;

    assert!(!dev.log.iter().any(|e| matches!(e.payload, ClientPayload::BargeIn { .. })));
    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TurnStatus::Succeeded);
}

// ─── Skill deadlines ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_fallback_before_twice_the_deadline_when_skill_never_returns() {
    let config = BuddyConfig::default();
    let filler = config.responses.filler.clone();
    let still_working = config.responses.skill_timeout.clone();
    let stuck: Arc<dyn Skill> = Arc::new(
        ScriptedSkill::new(
            SkillDescriptor::new("weather", "Never answers"),
            Duration::from_secs(3600),
            "too late",
        )
        .ignoring_cancel(),
    );
    let orch = orchestrator(config, Vec::new(), keyword_classifier(), 3, vec![stuck]);
    let mut dev = Device::connect(&orch, "porch").await;

    let started = Instant::now();
    dev.text("what's the weather").await;
    let (text, _) = dev.wait_response(ResponseKind::Filler).await;
    assert_eq!(text, filler);
    let (text, _) = dev.wait_response(ResponseKind::Fallback).await;
    let elapsed = started.elapsed();
    assert_eq!(text, still_working);
    assert!(elapsed >= Duration::from_secs(5), "fallback too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "fallback too late: {elapsed:?}");

    dev.wait_state(TurnState::Idle).await;
    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::SkillTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_late_skill_result_arrives_as_update() {
    let orch = orchestrator(
        BuddyConfig::default(),
        Vec::new(),
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_secs(7))],
    );
    let mut dev = Device::connect(&orch, "garage").await;

    let started = Instant::now();
    dev.text("what's the weather").await;
    let (_, fallback_turn) = dev.wait_response(ResponseKind::Fallback).await;
    let at = started.elapsed();
    assert!(
        at >= Duration::from_secs(5) && at < Duration::from_millis(5200),
        "fallback at {at:?}"
    );

    let update = dev
        .wait_for("skill update", |e| matches!(e.payload, ClientPayload::SkillUpdate { .. }))
        .await;
    let at = started.elapsed();
    assert!(
        at >= Duration::from_secs(7) && at < Duration::from_millis(7200),
        "update at {at:?}"
    );
    assert_eq!(update.turn_id, fallback_turn);
    match update.payload {
        ClientPayload::SkillUpdate { skill, text } => {
            assert_eq!(skill, "weather");
            assert_eq!(text, "Sunny and 21 degrees.");
        }
        _ => unreachable!(),
    }

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error_kind, Some(ErrorKind::SkillTimeout));
    assert!(
        orch.bus()
            .history(Some(dev.conn.session_id), 1000)
            .iter()
            .any(|e| matches!(e, RuntimeEvent::LateSkillResult { delivered: true, .. }))
    );
    assert_eq!(orch.dispatcher().stats()["weather"].late_completions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_skill_result_survives_barge_in_during_fallback() {
    let orch = orchestrator(
        BuddyConfig::default(),
        Vec::new(),
        keyword_classifier(),
        200,
        vec![weather_skill(Duration::from_secs(7))],
    );
    let mut dev = Device::connect(&orch, "workshop").await;

    let started = Instant::now();
    dev.text("what's the weather").await;
    let (_, fallback_turn) = dev.wait_response(ResponseKind::Fallback).await;
    dev.wait_state(TurnState::Speaking).await;
    dev.send(DeviceInput::PushToTalk).await;
    let listening = dev.wait_state(TurnState::Listening).await;
    assert_ne!(listening.turn_id, fallback_turn);

    let update = dev
        .wait_for("skill update", |e| matches!(e.payload, ClientPayload::SkillUpdate { .. }))
        .await;
    let at = started.elapsed();
    assert!(
        at >= Duration::from_secs(7) && at < Duration::from_millis(7200),
        "update at {at:?}"
    );
    assert_eq!(update.turn_id, fallback_turn);
    assert_eq!(orch.dispatcher().stats()["weather"].late_completions, 1);
    assert!(
        orch.bus()
            .history(Some(dev.conn.session_id), 1000)
            .iter()
            .any(|e| matches!(e, RuntimeEvent::BargeIn { .. }))
    );
}

// ─── Transcription edge cases ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_empty_transcript_returns_to_listening_without_a_record() {
    let orch = orchestrator(
        BuddyConfig::default(),
        vec![SegmentScript::says("")],
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "attic").await;

    dev.wake().await;
    dev.utterance().await;
    dev.wait_state(TurnState::Idle).await;

    assert_eq!(
        dev.states(),
        vec![
            TurnState::Listening,
            TurnState::Transcribing,
            TurnState::Listening,
            TurnState::Idle,
        ]
    );
    assert!(!dev.log.iter().any(|e| matches!(
        e.payload,
        ClientPayload::FinalTranscript { .. } | ClientPayload::ResponseText { .. }
    )));
    assert!(dev.history(&orch).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transcriber_failure_speaks_fallback() {
    let config = BuddyConfig::default();
    let message = config.responses.transcription_error.clone();
    let orch = orchestrator(
        config,
        vec![SegmentScript::failing()],
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "cellar").await;

    dev.wake().await;
    dev.utterance().await;
    let (text, _) = dev.wait_response(ResponseKind::Fallback).await;
    assert_eq!(text, message);
    dev.wait_state(TurnState::Idle).await;

    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::TranscriptionError));
    // Primary failed, then the one retry (against the primary, as no
    // fallback is configured) failed too.
    assert_eq!(orch.transcriber().fallback_count(), 1);
}

// ─── Clarification ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_low_confidence_twice_gives_up_after_two_rounds() {
    let config = BuddyConfig::default();
    let clarification = config.responses.clarification.clone();
    let not_understood = config.responses.not_understood.clone();
    let orch = orchestrator(
        config,
        Vec::new(),
        queued_classifier(vec![Intent::new("weather", 0.4), Intent::new("weather", 0.4)]),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "study").await;

    dev.text("mumble").await;
    let (text, first_turn) = dev.wait_response(ResponseKind::Clarification).await;
    assert_eq!(text, clarification);
    let listening = dev.wait_state(TurnState::Listening).await;
    assert_eq!(listening.turn_id, first_turn);

    dev.text("mumble again").await;
    let (text, second_turn) = dev.wait_response(ResponseKind::Fallback).await;
    assert_eq!(text, not_understood);
    assert_eq!(second_turn, first_turn);
    dev.wait_state(TurnState::Idle).await;

    let clarifications = dev
        .log
        .iter()
        .filter(|e| {
            matches!(
                e.payload,
                ClientPayload::ResponseText {
                    kind: ResponseKind::Clarification,
                    ..
                }
            )
        })
        .count();
    assert_eq!(clarifications, 1);

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::IntentAmbiguous));
    assert_eq!(history[0].clarification_rounds, 2);
    let snapshot = orch.manager().snapshot(dev.conn.session_id).await.unwrap();
    assert_eq!(snapshot.state, TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_intent_speaks_no_skill() {
    let config = BuddyConfig::default();
    let no_skill = config.responses.no_skill.clone();
    let orch = orchestrator(
        config,
        Vec::new(),
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "study").await;

    dev.text("read me the news").await;
    let (text, _) = dev.wait_response(ResponseKind::Fallback).await;
    assert_eq!(text, no_skill);
    dev.wait_state(TurnState::Idle).await;
    let history = dev.history(&orch).await;
    assert_eq!(history[0].error_kind, Some(ErrorKind::SkillError));
}

// ─── Stage deadlines ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_hung_classifier_gives_up_after_classify_timeout() {
    let mut config = BuddyConfig::default();
    config.session.idle_timeout_secs = 60;
    let not_understood = config.responses.not_understood.clone();
    let classifier =
        Arc::new(ScriptedClassifier::new(Vec::new()).with_latency(Duration::from_secs(86_400)));
    let orch = orchestrator(
        config,
        Vec::new(),
        classifier,
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "loft").await;

    let started = Instant::now();
    dev.text("what's the weather").await;
    let (text, _) = dev.wait_response(ResponseKind::Fallback).await;
    let at = started.elapsed();
    assert_eq!(text, not_understood);
    assert!(
        at >= Duration::from_secs(3) && at < Duration::from_millis(3200),
        "fallback at {at:?}"
    );
    dev.wait_state(TurnState::Idle).await;

    let history = dev.history(&orch).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::IntentAmbiguous));

    // The session is no longer pinned and expires normally.
    let closed = dev
        .wait_for("session closed", |e| matches!(e.payload, ClientPayload::SessionClosed { .. }))
        .await;
    assert!(matches!(
        closed.payload,
        ClientPayload::SessionClosed {
            reason: CloseReason::IdleTimeout
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_final_transcript_speaks_transcription_error() {
    let mut config = BuddyConfig::default();
    config.stt.job_timeout_ms = 2000;
    let message = config.responses.transcription_error.clone();
    let stt = Arc::new(
        ScriptedTranscriber::new("stalled", vec![SegmentScript::says("what's the weather")])
            .with_finalize_after(Duration::from_secs(3600)),
    );
    let tts = tone_tts(&config, 3);
    let orch = Orchestrator::new(
        config,
        providers(stt, tts, keyword_classifier()),
        table(vec![weather_skill(Duration::from_millis(10))]),
    )
    .expect("valid orchestrator");
    let mut dev = Device::connect(&orch, "shed").await;

    dev.wake().await;
    dev.utterance().await;
    let spoken = Instant::now();
    let (text, _) = dev.wait_response(ResponseKind::Fallback).await;
    assert_eq!(text, message);
    assert!(spoken.elapsed() <= Duration::from_secs(2), "fallback after {:?}", spoken.elapsed());
    dev.wait_state(TurnState::Idle).await;

    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::TranscriptionError));
    assert!(history[0].utterance.is_none());
}

// ─── Synthesis degradation ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_saturated_tts_pool_gives_text_only_reply() {
    let mut config = BuddyConfig::default();
    config.tts.pool_size = 1;
    config.tts.max_queue_wait_ms = 100;
    let orch = orchestrator(
        config,
        Vec::new(),
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let _held = orch
        .synthesizer()
        .admit(SessionId::new())
        .await
        .expect("free worker");
    let mut dev = Device::connect(&orch, "balcony").await;

    dev.text("what's the weather").await;
    let (text, _) = dev.wait_response(ResponseKind::Answer).await;
    assert_eq!(text, "Sunny and 21 degrees.");
    dev.wait_state(TurnState::Idle).await;

    assert!(!dev.log.iter().any(|e| matches!(
        e.payload,
        ClientPayload::ResponseAudio(_) | ClientPayload::ResponseAudioEnd
    )));
    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Succeeded);
    assert!(history[0].degraded);
    assert!(
        orch.bus()
            .history(Some(dev.conn.session_id), 1000)
            .iter()
            .any(|e| matches!(e, RuntimeEvent::PoolSaturated { pool: "tts", .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_after_retry_fails_turn() {
    let config = BuddyConfig::default();
    let message = config.responses.synthesis_error.clone();
    let tts = Arc::new(ToneSynthesizer::failing("broken", &config.audio));
    let orch = Orchestrator::new(
        config,
        providers(scripted_stt(Vec::new()), tts.clone(), keyword_classifier()),
        table(vec![weather_skill(Duration::from_millis(10))]),
    )
    .expect("valid orchestrator");
    let mut dev = Device::connect(&orch, "pantry").await;

    dev.text("what's the weather").await;
    let (answer, answer_turn) = dev.wait_response(ResponseKind::Answer).await;
    assert_eq!(answer, "Sunny and 21 degrees.");
    let (text, fallback_turn) = dev.wait_response(ResponseKind::Fallback).await;
    assert_eq!(text, message);
    assert_eq!(fallback_turn, answer_turn);
    dev.wait_state(TurnState::Idle).await;

    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Failed);
    assert_eq!(history[0].error_kind, Some(ErrorKind::SynthesisError));
    assert!(history[0].degraded);
    assert_eq!(tts.calls(), 2);
    assert_eq!(orch.synthesizer().fallback_count(), 1);
}

// ─── Speculative understanding ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_matching_partial_skips_second_classification() {
    let classifier = keyword_classifier();
    let orch = orchestrator(
        BuddyConfig::default(),
        vec![SegmentScript::says("What's the weather?").with_partials(&["what's the weather"])],
        classifier.clone(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "nursery").await;

    dev.wake().await;
    dev.utterance().await;
    dev.wait_state(TurnState::Idle).await;

    assert!(dev.log.iter().any(|e| matches!(
        &e.payload,
        ClientPayload::PartialTranscript { text } if text == "what's the weather"
    )));
    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Succeeded);
    assert_eq!(history[0].intent.as_ref().unwrap().name, "weather");
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_differing_partial_is_discarded() {
    let classifier = keyword_classifier();
    let orch = orchestrator(
        BuddyConfig::default(),
        vec![SegmentScript::says("what time is it").with_partials(&["what's the weather"])],
        classifier.clone(),
        3,
        builtin_skills(),
    );
    let mut dev = Device::connect(&orch, "landing").await;

    dev.wake().await;
    dev.utterance().await;
    dev.wait_state(TurnState::Idle).await;

    let history = dev.history(&orch).await;
    assert_eq!(history[0].status, TurnStatus::Succeeded);
    assert_eq!(history[0].utterance.as_deref(), Some("what time is it"));
    assert_eq!(history[0].intent.as_ref().unwrap().name, "time");
    assert_eq!(classifier.calls(), 2);
}

// ─── Listen timeout ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silent_listen_timeout_abandons_turn_without_record() {
    let config = BuddyConfig::default();
    let listen_timeout = config.turn.listen_timeout();
    let orch = orchestrator(
        config,
        Vec::new(),
        keyword_classifier(),
        3,
        vec![weather_skill(Duration::from_millis(10))],
    );
    let mut dev = Device::connect(&orch, "porch").await;

    dev.send(DeviceInput::PushToTalk).await;
    let listening = dev.wait_state(TurnState::Listening).await;
    let started = Instant::now();
    let idle = dev.wait_state(TurnState::Idle).await;

    assert_eq!(idle.turn_id, listening.turn_id);
    assert!(started.elapsed() >= listen_timeout - Duration::from_millis(50));
    assert!(started.elapsed() < listen_timeout + Duration::from_millis(200));
    assert_eq!(dev.states(), vec![TurnState::Listening, TurnState::Idle]);
    assert!(!dev.log.iter().any(|e| matches!(e.payload, ClientPayload::ResponseText { .. })));
    assert!(dev.history(&orch).await.is_empty());
}
