//! Message types passed between pipeline stages and to clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::pipeline::turn::TurnState;

/// Identifier of a dialogue session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Allocate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one turn within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub Uuid);

impl TurnId {
    /// Allocate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A fixed-size chunk of PCM audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved f32 samples in \[-1, 1\].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Monotonic sequence number within its stream.
    pub seq: u64,
    /// When the frame was captured or synthesized.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Build a frame stamped with the current time.
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, seq: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            seq,
            captured_at: Instant::now(),
        }
    }

    /// Playback duration of this frame.
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_micros(per_channel * 1_000_000 / u64::from(self.sample_rate))
    }

    /// RMS energy of the frame.
    #[must_use]
    pub fn rms(&self) -> f32 {
        compute_rms_energy(&self.samples)
    }
}

/// Compute RMS energy of audio samples.
#[must_use]
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// A contiguous run of frames between speech start and speech end.
#[derive(Debug, Clone, Default)]
pub struct VoiceSegment {
    pub frames: Vec<AudioFrame>,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl VoiceSegment {
    /// Append a frame, stamping the start on the first one.
    pub fn push(&mut self, frame: AudioFrame) {
        if self.started_at.is_none() {
            self.started_at = Some(frame.captured_at);
        }
        self.frames.push(frame);
    }

    /// Total audio duration covered by the segment.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    /// Whether the segment holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A transcription result from the STT stage.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub session_id: SessionId,
    /// The transcribed text.
    pub text: String,
    /// Whether this is a final transcription (vs partial/streaming).
    pub is_final: bool,
    /// Provider confidence in \[0, 1\].
    pub confidence: f32,
    pub timestamp: Instant,
}

/// A slot value extracted from an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl SlotValue {
    /// Text view of the value, if it is textual.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Named slot map; ordered so records serialize deterministically.
pub type Slots = BTreeMap<String, SlotValue>;

/// A classified intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub slots: Slots,
    /// Classifier confidence in \[0, 1\].
    pub confidence: f32,
}

impl Intent {
    /// Intent with no slots.
    #[must_use]
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            slots: Slots::new(),
            confidence,
        }
    }

    /// Builder-style slot insertion.
    #[must_use]
    pub fn with_slot(mut self, key: impl Into<String>, value: SlotValue) -> Self {
        self.slots.insert(key.into(), value);
        self
    }
}

/// What started a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    WakeWord,
    PushToTalk,
    Text,
}

/// Inbound traffic from a connected device or text client.
#[derive(Debug, Clone)]
pub enum DeviceInput {
    /// A microphone frame.
    Audio(AudioFrame),
    /// Explicit push-to-talk press.
    PushToTalk,
    /// A typed message (text clients enter directly at NLU).
    Text(String),
    /// The device lost its microphone. Session-fatal.
    CaptureError(String),
    /// The client is going away.
    Disconnect,
}

/// Kind of a spoken or displayed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// The answer to the user's request.
    Answer,
    /// A request to repeat after a low-confidence intent.
    Clarification,
    /// Spoken while a slow skill is still running.
    Filler,
    /// A terminal fallback after a stage failure.
    Fallback,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum CloseReason {
    Disconnected,
    IdleTimeout,
    Expired,
    CaptureError(String),
    Shutdown,
}

/// Outbound event delivered to a client.
///
/// `seq` is monotonic per session; `turn_id` lets clients drop stale output
/// after a barge-in and merge late skill updates idempotently.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub seq: u64,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub payload: ClientPayload,
}

/// Payload of an outbound client event.
#[derive(Debug, Clone)]
pub enum ClientPayload {
    SessionStarted,
    StateChanged { state: TurnState },
    PartialTranscript { text: String },
    FinalTranscript { text: String },
    ResponseText { text: String, kind: ResponseKind },
    ResponseAudio(AudioFrame),
    ResponseAudioEnd,
    /// Acknowledges that the named turn was cancelled by a barge-in.
    BargeIn { cancelled: TurnId },
    /// Out-of-band result of a skill that finished after its deadline.
    SkillUpdate { skill: String, text: String },
    SessionClosed { reason: CloseReason },
}

impl ClientPayload {
    /// Short event name used by hosts and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session.started",
            Self::StateChanged { .. } => "turn.state",
            Self::PartialTranscript { .. } => "transcript.partial",
            Self::FinalTranscript { .. } => "transcript.final",
            Self::ResponseText { .. } => "response.text",
            Self::ResponseAudio(_) => "response.audio",
            Self::ResponseAudioEnd => "response.audio_end",
            Self::BargeIn { .. } => "turn.barge_in",
            Self::SkillUpdate { .. } => "skill.update",
            Self::SessionClosed { .. } => "session.closed",
        }
    }
}
