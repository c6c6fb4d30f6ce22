//! Voice Activity Detection using energy-based analysis.
//!
//! Uses RMS energy thresholding to find speech start and end-of-utterance
//! in a triggered frame stream. Durations are counted in stream time.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioFrame, VoiceSegment};
use tracing::debug;

/// Outcome of feeding one frame.
#[derive(Debug)]
pub enum VadEvent {
    /// No speech in progress.
    Silence,
    /// Speech began with this frame.
    SpeechStart,
    /// Speech continues (includes trailing silence within tolerance).
    Speech,
    /// End of utterance; the completed segment is handed over.
    SpeechEnd(VoiceSegment),
    /// Speech ended but was shorter than the minimum; treat as noise.
    Discarded,
}

/// Voice activity detector using RMS energy thresholding.
#[derive(Debug)]
pub struct EnergyVad {
    threshold: f32,
    min_silence_ms: u64,
    min_speech_ms: u64,
    max_speech_ms: u64,
    segment: VoiceSegment,
    in_speech: bool,
    /// Trailing silence of the current segment.
    silence_ms: u64,
    /// Voiced audio in the current segment.
    voiced_ms: u64,
}

impl EnergyVad {
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_silence_ms: u64::from(config.min_silence_duration_ms),
            min_speech_ms: u64::from(config.min_speech_duration_ms),
            max_speech_ms: u64::from(config.max_speech_duration_ms),
            segment: VoiceSegment::default(),
            in_speech: false,
            silence_ms: 0,
            voiced_ms: 0,
        }
    }

    /// Whether a speech segment is open.
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Process a frame and report speech boundaries.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> VadEvent {
        let frame_ms = u64::try_from(frame.duration().as_millis()).unwrap_or(0);
        let is_speech = frame.rms() > self.threshold;

        if !self.in_speech {
            if !is_speech {
                return VadEvent::Silence;
            }
            self.in_speech = true;
            self.silence_ms = 0;
            self.voiced_ms = frame_ms;
            self.segment = VoiceSegment::default();
            self.segment.push(frame.clone());
            debug!(seq = frame.seq, "speech start");
            return VadEvent::SpeechStart;
        }

        self.segment.push(frame.clone());
        if is_speech {
            self.silence_ms = 0;
            self.voiced_ms += frame_ms;
        } else {
            self.silence_ms += frame_ms;
        }

        let total_ms = self.voiced_ms + self.silence_ms;
        if self.silence_ms >= self.min_silence_ms || total_ms >= self.max_speech_ms {
            return self.finish(frame);
        }
        VadEvent::Speech
    }

    /// Close an open segment now (e.g. the feed ended).
    pub fn flush(&mut self) -> Option<VadEvent> {
        if !self.in_speech {
            return None;
        }
        self.in_speech = false;
        let segment = std::mem::take(&mut self.segment);
        if self.voiced_ms < self.min_speech_ms {
            return Some(VadEvent::Discarded);
        }
        Some(VadEvent::SpeechEnd(segment))
    }

    fn finish(&mut self, frame: &AudioFrame) -> VadEvent {
        self.in_speech = false;
        let mut segment = std::mem::take(&mut self.segment);
        segment.ended_at = Some(frame.captured_at);
        if self.voiced_ms < self.min_speech_ms {
            debug!(voiced_ms = self.voiced_ms, "speech too short, discarded");
            return VadEvent::Discarded;
        }
        debug!(
            voiced_ms = self.voiced_ms,
            frames = segment.frames.len(),
            "speech end"
        );
        VadEvent::SpeechEnd(segment)
    }

    /// Reset the VAD state, dropping any buffered frames.
    pub fn reset(&mut self) {
        self.segment = VoiceSegment::default();
        self.in_speech = false;
        self.silence_ms = 0;
        self.voiced_ms = 0;
    }
}
