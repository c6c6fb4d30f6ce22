//! Configuration types for the dialogue core.

use crate::error::{BuddyError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuddyConfig {
    /// Audio frame format and device channel sizes.
    pub audio: AudioConfig,
    /// Wake word spotting.
    pub wakeword: WakewordConfig,
    /// Voice activity detection.
    pub vad: VadConfig,
    /// Speech-to-text provider pool.
    pub stt: ProviderPoolConfig,
    /// Text-to-speech provider pool.
    pub tts: ProviderPoolConfig,
    /// Intent classification.
    pub nlu: NluConfig,
    /// Turn controller: latency budget, barge-in, pending queue.
    pub turn: TurnConfig,
    /// Skill dispatch.
    pub skills: SkillsConfig,
    /// Session lifecycle and history.
    pub session: SessionConfig,
    /// Event bus channel sizes and history.
    pub bus: BusConfig,
    /// User-facing phrases used for prompts and fallbacks.
    pub responses: ResponsesConfig,
}

/// Audio frame format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of inbound and synthesized frames in Hz.
    pub sample_rate: u32,
    /// Number of channels (1 = mono).
    pub channels: u16,
    /// Duration of one frame in milliseconds.
    pub frame_ms: u32,
    /// Capacity of the per-device inbound channel.
    pub device_channel_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 20,
            device_channel_size: 64,
        }
    }
}

impl AudioConfig {
    /// Number of samples in one frame.
    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000 * self.channels as usize
    }
}

/// Wake word spotting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakewordConfig {
    /// Whether audio frames are scanned for the wake signal at all.
    pub enabled: bool,
    /// RMS level a frame must exceed to count towards a wake burst.
    pub threshold: f32,
    /// Minimum burst length in ms before a detection fires.
    pub min_burst_ms: u32,
    /// Quiet time required before a burst can start, in ms.
    pub min_leading_silence_ms: u32,
    /// Minimum time between two detections, in ms.
    pub cooldown_ms: u64,
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.3,
            min_burst_ms: 60,
            min_leading_silence_ms: 200,
            cooldown_ms: 2000,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.05:  only loud/close speech
    pub threshold: f32,
    /// Silence in ms that ends a speech segment.
    pub min_silence_duration_ms: u32,
    /// Minimum speech duration in ms for a segment to count.
    pub min_speech_duration_ms: u32,
    /// Hard cap on a single segment, in ms.
    pub max_speech_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            min_silence_duration_ms: 600,
            min_speech_duration_ms: 200,
            max_speech_duration_ms: 10_000,
        }
    }
}

/// Shared provider pool configuration (used for both STT and TTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPoolConfig {
    /// Concurrent jobs the provider can run across all sessions.
    pub pool_size: usize,
    /// Longest a job may queue for a worker before the session degrades.
    pub max_queue_wait_ms: u64,
    /// Retries against the fallback provider after a primary failure.
    pub fallback_retries: u32,
    /// How long an admitted job may run before the turn gives up on it, in ms.
    ///
    /// For STT this counts from end of speech to the final transcript; for
    /// TTS it covers the whole utterance.
    pub job_timeout_ms: u64,
}

impl Default for ProviderPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_queue_wait_ms: 300,
            fallback_retries: 1,
            job_timeout_ms: 30_000,
        }
    }
}

impl ProviderPoolConfig {
    /// Admission wait bound as a `Duration`.
    #[must_use]
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// Intent classification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NluConfig {
    /// Intents below this confidence trigger a clarification round.
    pub confidence_threshold: f32,
    /// Clarification rounds before the turn gives up.
    pub max_clarification_rounds: u32,
    /// Run the classifier on partial transcripts ahead of the final.
    pub speculative: bool,
    /// Longest the classifier may take on a final utterance, in ms.
    pub classify_timeout_ms: u64,
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_clarification_rounds: 2,
            speculative: true,
            classify_timeout_ms: 3000,
        }
    }
}

impl NluConfig {
    #[must_use]
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }
}

/// Behaviour when a text message arrives while a response is being spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingDropPolicy {
    /// Drop the oldest queued message to keep the newest input.
    #[default]
    Oldest,
    /// Reject the incoming message when the queue is full.
    Incoming,
}

/// Turn controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Soft budget from trigger to final intent, in ms.
    pub nlu_budget_ms: u64,
    /// Soft budget for the whole turn, in ms.
    pub turn_budget_ms: u64,
    /// Speak a filler phrase when the turn budget elapses during skill dispatch.
    pub filler_enabled: bool,
    /// Give up listening after this long without speech, in ms.
    pub listen_timeout_ms: u64,
    /// Whether wake/push-to-talk interrupts an active turn.
    pub barge_in_enabled: bool,
    /// Text messages held while a response is playing.
    pub max_pending_inputs: usize,
    /// What to drop when the pending queue is full.
    pub pending_drop_policy: PendingDropPolicy,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            nlu_budget_ms: 600,
            turn_budget_ms: 1500,
            filler_enabled: true,
            listen_timeout_ms: 8000,
            barge_in_enabled: true,
            max_pending_inputs: 4,
            pending_drop_policy: PendingDropPolicy::Oldest,
        }
    }
}

impl TurnConfig {
    /// Wake-to-intent budget.
    #[must_use]
    pub fn nlu_budget(&self) -> Duration {
        Duration::from_millis(self.nlu_budget_ms)
    }

    /// Whole-turn budget.
    #[must_use]
    pub fn turn_budget(&self) -> Duration {
        Duration::from_millis(self.turn_budget_ms)
    }

    /// Listening timeout.
    #[must_use]
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

/// Skill dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Deadline for skills that do not declare their own, in ms.
    pub default_deadline_ms: u64,
    /// Retries for idempotent skills that fail (never applied to timeouts).
    pub max_retries: u32,
    /// Skill calls allowed in flight across all sessions.
    pub max_concurrent: usize,
    /// How long a timed-out call is still awaited for a late result, in ms.
    pub late_result_grace_ms: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 5000,
            max_retries: 1,
            max_concurrent: 32,
            late_result_grace_ms: 30_000,
        }
    }
}

impl SkillsConfig {
    /// Default deadline as a `Duration`.
    #[must_use]
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    /// Late result grace window as a `Duration`.
    #[must_use]
    pub fn late_result_grace(&self) -> Duration {
        Duration::from_millis(self.late_result_grace_ms)
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity window after which a session is destroyed, in seconds.
    pub idle_timeout_secs: u64,
    /// Turn records retained per session.
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            history_window: 20,
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a `Duration`.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of each session's stage-result channel.
    pub stage_channel_size: usize,
    /// Capacity of each session's outbound client channel.
    pub outbound_channel_size: usize,
    /// Capacity of the session command channel.
    pub command_channel_size: usize,
    /// Capacity of the observability broadcast.
    pub runtime_broadcast_size: usize,
    /// Observability events kept for replay.
    pub max_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stage_channel_size: 32,
            outbound_channel_size: 256,
            command_channel_size: 16,
            runtime_broadcast_size: 256,
            max_history: 1000,
        }
    }
}

/// User-facing phrases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsesConfig {
    pub clarification: String,
    pub not_understood: String,
    pub filler: String,
    pub skill_timeout: String,
    pub skill_error: String,
    pub no_skill: String,
    pub transcription_error: String,
    pub synthesis_error: String,
    pub stt_overloaded: String,
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        Self {
            clarification: "Sorry, could you say that again?".to_owned(),
            not_understood: "I didn't catch that.".to_owned(),
            filler: "Still thinking...".to_owned(),
            skill_timeout: "I'm still working on that. I'll let you know when it's done."
                .to_owned(),
            skill_error: "Something went wrong while I was doing that.".to_owned(),
            no_skill: "I can't help with that yet.".to_owned(),
            transcription_error: "Sorry, I couldn't hear that properly.".to_owned(),
            synthesis_error: "I have an answer but can't speak right now.".to_owned(),
            stt_overloaded: "I'm a bit busy right now, please repeat that.".to_owned(),
        }
    }
}

impl BuddyConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| BuddyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| BuddyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file: `<config dir>/buddy/config.toml`.
    ///
    /// The directory can be overridden with `BUDDY_CONFIG_DIR`.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        if let Some(override_dir) = std::env::var_os("BUDDY_CONFIG_DIR") {
            return PathBuf::from(override_dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("buddy"))
            .unwrap_or_else(|| PathBuf::from("/tmp/buddy-config"))
            .join("config.toml")
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `BuddyError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 || self.audio.channels == 0 {
            return Err(BuddyError::Config(
                "audio sample_rate, frame_ms and channels must be non-zero".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.nlu.confidence_threshold) {
            return Err(BuddyError::Config(format!(
                "nlu.confidence_threshold must be within [0, 1], got {}",
                self.nlu.confidence_threshold
            )));
        }
        if self.stt.pool_size == 0 || self.tts.pool_size == 0 {
            return Err(BuddyError::Config(
                "stt.pool_size and tts.pool_size must be at least 1".to_owned(),
            ));
        }
        if self.nlu.classify_timeout_ms == 0
            || self.stt.job_timeout_ms == 0
            || self.tts.job_timeout_ms == 0
        {
            return Err(BuddyError::Config(
                "nlu.classify_timeout_ms and stt/tts job_timeout_ms must be non-zero".to_owned(),
            ));
        }
        if self.skills.max_concurrent == 0 {
            return Err(BuddyError::Config(
                "skills.max_concurrent must be at least 1".to_owned(),
            ));
        }
        if self.session.history_window == 0 {
            return Err(BuddyError::Config(
                "session.history_window must be at least 1".to_owned(),
            ));
        }
        if self.bus.stage_channel_size == 0
            || self.bus.outbound_channel_size == 0
            || self.bus.command_channel_size == 0
            || self.bus.runtime_broadcast_size == 0
        {
            return Err(BuddyError::Config(
                "bus channel sizes must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
