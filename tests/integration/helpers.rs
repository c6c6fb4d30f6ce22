//! Shared helpers for integration tests.
//!
//! Every scenario runs on a paused tokio clock. Audio is paced at the
//! configured frame duration, so sleeps auto-advance and the pipeline sees
//! a real-time stream.

use buddy::config::BuddyConfig;
use buddy::nlu::IntentClassifier;
use buddy::pipeline::messages::{
    ClientEvent, ClientPayload, DeviceInput, Intent, ResponseKind, TurnId,
};
use buddy::pipeline::turn::{TurnRecord, TurnState};
use buddy::scripted::{
    ScriptedClassifier, ScriptedSkill, ScriptedTranscriber, SegmentScript, ToneSynthesizer,
    tone_frame,
};
use buddy::skills::{Skill, SkillDescriptor, SkillTable};
use buddy::stt::Transcriber;
use buddy::tts::Synthesizer;
use buddy::{DeviceConnection, Orchestrator, Providers};
use std::sync::Arc;
use std::time::Duration;

/// Amplitude that fires the energy wake spotter.
pub(crate) const WAKE_LEVEL: f32 = 0.5;
/// Amplitude the VAD treats as speech but the spotter ignores.
pub(crate) const SPEECH_LEVEL: f32 = 0.1;

/// Upper bound on any single wait; a scenario that blocks longer is broken.
const EVENT_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) fn providers(
    stt: Arc<dyn Transcriber>,
    tts: Arc<dyn Synthesizer>,
    classifier: Arc<dyn IntentClassifier>,
) -> Providers {
    Providers {
        stt,
        stt_fallback: None,
        tts,
        tts_fallback: None,
        classifier,
        spotter: None,
    }
}

/// Synthesizer producing `frames` frames at the audio frame pace.
pub(crate) fn tone_tts(config: &BuddyConfig, frames: usize) -> Arc<ToneSynthesizer> {
    Arc::new(ToneSynthesizer::new(
        "tone",
        &config.audio,
        frames,
        Duration::from_millis(u64::from(config.audio.frame_ms)),
    ))
}

pub(crate) fn scripted_stt(segments: Vec<SegmentScript>) -> Arc<ScriptedTranscriber> {
    Arc::new(ScriptedTranscriber::new("scripted", segments))
}

pub(crate) fn keyword_classifier() -> Arc<ScriptedClassifier> {
    Arc::new(ScriptedClassifier::new(Vec::new()))
}

pub(crate) fn queued_classifier(intents: Vec<Intent>) -> Arc<ScriptedClassifier> {
    Arc::new(ScriptedClassifier::new(intents))
}

/// A `weather` skill answering after `delay`.
pub(crate) fn weather_skill(delay: Duration) -> Arc<ScriptedSkill> {
    Arc::new(ScriptedSkill::new(
        SkillDescriptor::new("weather", "Forecast lookup"),
        delay,
        "Sunny and 21 degrees.",
    ))
}

pub(crate) fn table(skills: Vec<Arc<dyn Skill>>) -> SkillTable {
    SkillTable::new(skills)
}

/// One connected device and everything it has received so far.
pub(crate) struct Device {
    pub(crate) conn: DeviceConnection,
    pub(crate) log: Vec<ClientEvent>,
    config: BuddyConfig,
    seq: u64,
}

impl Device {
    pub(crate) async fn connect(orchestrator: &Orchestrator, channel: &str) -> Self {
        let conn = orchestrator.connect(channel).await.expect("connect device");
        Self {
            conn,
            log: Vec::new(),
            config: orchestrator.config().clone(),
            seq: 0,
        }
    }

    /// Send `count` frames at `amplitude`, one per frame duration.
    pub(crate) async fn frames(&mut self, amplitude: f32, count: usize) {
        let pace = Duration::from_millis(u64::from(self.config.audio.frame_ms));
        for _ in 0..count {
            let frame = tone_frame(&self.config.audio, amplitude, self.seq);
            self.seq += 1;
            self.conn
                .input
                .send(DeviceInput::Audio(frame))
                .await
                .expect("device input open");
            tokio::time::sleep(pace).await;
        }
    }

    /// Three loud frames: enough for the energy spotter.
    pub(crate) async fn wake(&mut self) {
        self.frames(WAKE_LEVEL, 3).await;
    }

    /// 200 ms of speech followed by enough silence to end the segment.
    pub(crate) async fn utterance(&mut self) {
        let frame_ms = self.config.audio.frame_ms.max(1);
        let speech = (self.config.vad.min_speech_duration_ms / frame_ms) as usize;
        let silence = (self.config.vad.min_silence_duration_ms / frame_ms) as usize;
        self.frames(SPEECH_LEVEL, speech.max(1)).await;
        self.frames(0.0, silence.max(1)).await;
    }

    pub(crate) async fn text(&mut self, text: &str) {
        self.send(DeviceInput::Text(text.to_owned())).await;
    }

    pub(crate) async fn send(&mut self, input: DeviceInput) {
        self.conn.input.send(input).await.expect("device input open");
    }

    /// Next event, logged.
    pub(crate) async fn next(&mut self) -> Option<ClientEvent> {
        let event = tokio::time::timeout(EVENT_TIMEOUT, self.conn.events.recv())
            .await
            .expect("timed out waiting for a client event")?;
        self.log.push(event.clone());
        Some(event)
    }

    /// Consume events until one matches.
    pub(crate) async fn wait_for(
        &mut self,
        what: &str,
        mut pred: impl FnMut(&ClientEvent) -> bool,
    ) -> ClientEvent {
        loop {
            let Some(event) = self.next().await else {
                panic!("event stream ended while waiting for {what}; log: {:#?}", self.names());
            };
            if pred(&event) {
                return event;
            }
        }
    }

    pub(crate) async fn wait_state(&mut self, state: TurnState) -> ClientEvent {
        self.wait_for(&format!("state {state}"), |e| {
            matches!(&e.payload, ClientPayload::StateChanged { state: s } if *s == state)
        })
        .await
    }

    /// Wait for a response text of `kind`, returning it with its turn.
    pub(crate) async fn wait_response(&mut self, kind: ResponseKind) -> (String, Option<TurnId>) {
        let event = self
            .wait_for(&format!("{kind:?} response"), |e| {
                matches!(&e.payload, ClientPayload::ResponseText { kind: k, .. } if *k == kind)
            })
            .await;
        match event.payload {
            ClientPayload::ResponseText { text, .. } => (text, event.turn_id),
            _ => unreachable!(),
        }
    }

    /// Events received so far without waiting.
    pub(crate) fn drain(&mut self) {
        while let Some(event) = self.conn.events.try_recv() {
            self.log.push(event);
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.log
            .iter()
            .map(|e| match &e.payload {
                ClientPayload::StateChanged { state } => format!("turn.state:{state}"),
                other => other.name().to_owned(),
            })
            .collect()
    }

    pub(crate) fn states(&self) -> Vec<TurnState> {
        self.log
            .iter()
            .filter_map(|e| match e.payload {
                ClientPayload::StateChanged { state } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub(crate) async fn history(&self, orchestrator: &Orchestrator) -> Vec<TurnRecord> {
        orchestrator
            .manager()
            .history(self.conn.session_id)
            .await
            .expect("session alive")
    }
}
