//! Deterministic providers and skills.
//!
//! Used by the host bridge (text clients have no real speech stack), the
//! latency harness and the integration tests. Everything here runs on tokio
//! time, so paused-clock tests see exact latencies.

use crate::config::AudioConfig;
use crate::error::{BuddyError, Result};
use crate::nlu::{IntentClassifier, KeywordClassifier};
use crate::pipeline::messages::{AudioFrame, Intent, Slots, TranscriptEvent};
use crate::skills::{Skill, SkillContext, SkillDescriptor, SkillFailure, SkillOutput};
use crate::stt::{SegmentFeed, Transcriber};
use crate::tts::Synthesizer;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A frame of constant amplitude in the configured format.
#[must_use]
pub fn tone_frame(audio: &AudioConfig, amplitude: f32, seq: u64) -> AudioFrame {
    AudioFrame::new(
        vec![amplitude; audio.samples_per_frame()],
        audio.sample_rate,
        audio.channels,
        seq,
    )
}

/// What the transcriber says about one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentScript {
    /// Emitted one per received frame, in order.
    pub partials: Vec<String>,
    pub final_text: String,
    pub confidence: f32,
    /// Fail after the feed closes instead of sending the final.
    pub fail: bool,
}

impl SegmentScript {
    #[must_use]
    pub fn says(final_text: &str) -> Self {
        Self {
            partials: Vec::new(),
            final_text: final_text.to_owned(),
            confidence: 0.95,
            fail: false,
        }
    }

    #[must_use]
    pub fn with_partials(mut self, partials: &[&str]) -> Self {
        self.partials = partials.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

/// Transcriber that replays scripted segments in order.
///
/// Once the script runs out the last segment repeats.
pub struct ScriptedTranscriber {
    name: String,
    script: Mutex<VecDeque<SegmentScript>>,
    last: Mutex<SegmentScript>,
    /// Delay between the end of the feed and the final transcript.
    finalize_after: Duration,
    calls: AtomicU32,
}

impl ScriptedTranscriber {
    #[must_use]
    pub fn new(name: &str, script: Vec<SegmentScript>) -> Self {
        Self {
            name: name.to_owned(),
            last: Mutex::new(script.last().cloned().unwrap_or_default()),
            script: Mutex::new(script.into()),
            finalize_after: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_finalize_after(mut self, delay: Duration) -> Self {
        self.finalize_after = delay;
        self
    }

    /// Segments transcribed so far, including failed ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_segment(&self) -> SegmentScript {
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(segment) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = segment.clone();
                }
                segment
            }
            None => self.last.lock().map(|l| l.clone()).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transcribe(
        &self,
        mut feed: SegmentFeed,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let segment = self.next_segment();
        let mut partials = segment.partials.iter();
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = feed.frames.recv() => frame,
            };
            if frame.is_none() {
                break;
            }
            if let Some(text) = partials.next() {
                let event = TranscriptEvent {
                    session_id: feed.session_id,
                    text: text.clone(),
                    is_final: false,
                    confidence: segment.confidence,
                    timestamp: Instant::now(),
                };
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(self.finalize_after) => {}
        }
        if segment.fail {
            return Err(BuddyError::Transcription(format!("{} failed", self.name)));
        }
        let _ = events
            .send(TranscriptEvent {
                session_id: feed.session_id,
                text: segment.final_text,
                is_final: true,
                confidence: segment.confidence,
                timestamp: Instant::now(),
            })
            .await;
        Ok(())
    }
}

/// Synthesizer that streams a fixed number of quiet frames per utterance.
pub struct ToneSynthesizer {
    name: String,
    audio: AudioConfig,
    frames: usize,
    frame_interval: Duration,
    fail: bool,
    calls: AtomicU32,
}

impl ToneSynthesizer {
    #[must_use]
    pub fn new(name: &str, audio: &AudioConfig, frames: usize, frame_interval: Duration) -> Self {
        Self {
            name: name.to_owned(),
            audio: audio.clone(),
            frames,
            frame_interval,
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    /// A synthesizer that always fails.
    #[must_use]
    pub fn failing(name: &str, audio: &AudioConfig) -> Self {
        Self {
            fail: true,
            ..Self::new(name, audio, 0, Duration::ZERO)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(
        &self,
        _text: &str,
        frames: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(BuddyError::Synthesis(format!("{} unavailable", self.name)));
        }
        for seq in 0..self.frames {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.frame_interval) => {}
            }
            let frame = tone_frame(&self.audio, 0.0, seq as u64);
            if frames.send(frame).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Classifier that answers from a queue, then falls back to keywords.
pub struct ScriptedClassifier {
    queue: Mutex<VecDeque<Intent>>,
    latency: Duration,
    keywords: KeywordClassifier,
    calls: AtomicU32,
}

impl ScriptedClassifier {
    #[must_use]
    pub fn new(intents: Vec<Intent>) -> Self {
        Self {
            queue: Mutex::new(intents.into()),
            latency: Duration::ZERO,
            keywords: KeywordClassifier::new(),
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Classifications started so far, speculative ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IntentClassifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, text: &str, context: &Slots) -> Result<Intent> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(intent) => Ok(intent),
            None => self.keywords.classify(text, context).await,
        }
    }
}

/// Skill that answers after a fixed delay.
pub struct ScriptedSkill {
    descriptor: SkillDescriptor,
    delay: Duration,
    reply: std::result::Result<String, String>,
    /// Keep running after cancellation, like an uncooperative backend.
    ignore_cancel: bool,
    calls: AtomicU32,
}

impl ScriptedSkill {
    #[must_use]
    pub fn new(descriptor: SkillDescriptor, delay: Duration, reply: &str) -> Self {
        Self {
            descriptor,
            delay,
            reply: Ok(reply.to_owned()),
            ignore_cancel: false,
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn failing(descriptor: SkillDescriptor, delay: Duration, error: &str) -> Self {
        Self {
            reply: Err(error.to_owned()),
            ..Self::new(descriptor, delay, "")
        }
    }

    #[must_use]
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Skill for ScriptedSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        _intent: &Intent,
        ctx: SkillContext,
    ) -> std::result::Result<SkillOutput, SkillFailure> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.ignore_cancel {
            tokio::time::sleep(self.delay).await;
        } else {
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(SkillFailure::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        match &self.reply {
            Ok(text) => Ok(SkillOutput::text(text.clone())),
            Err(error) => Err(SkillFailure::Failed(error.clone())),
        }
    }
}
