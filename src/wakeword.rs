//! Wake word spotting.
//!
//! Spotters are stateful and owned by a single device's frontend task, so
//! each connection gets a fresh instance from a [`SpotterFactory`].
//!
//! The built-in [`EnergyBurstSpotter`] fires on a short loud burst that
//! follows a stretch of quiet. Real keyword models plug in through the
//! [`WakeWordSpotter`] trait.

use crate::config::WakewordConfig;
use crate::pipeline::messages::AudioFrame;
use std::sync::Arc;
use tracing::debug;

/// Detects the wake signal in a live frame stream.
pub trait WakeWordSpotter: Send {
    /// Feed one frame. Returns `true` when the wake word completes in it.
    fn process(&mut self, frame: &AudioFrame) -> bool;

    /// Forget any partial detection state.
    fn reset(&mut self);
}

/// Builds a spotter per connected device.
pub type SpotterFactory = Arc<dyn Fn() -> Box<dyn WakeWordSpotter> + Send + Sync>;

/// Factory for the built-in energy spotter.
#[must_use]
pub fn energy_spotter_factory(config: &WakewordConfig) -> SpotterFactory {
    let config = config.clone();
    Arc::new(move || Box::new(EnergyBurstSpotter::new(&config)) as Box<dyn WakeWordSpotter>)
}

/// Energy-burst wake detector with a cooldown.
///
/// All timing is measured in stream time (samples consumed), so detection is
/// independent of wall-clock jitter.
#[derive(Debug, Clone)]
pub struct EnergyBurstSpotter {
    threshold: f32,
    min_burst_ms: u64,
    min_leading_silence_ms: u64,
    cooldown_ms: u64,
    /// Stream time consumed so far.
    stream_ms: u64,
    quiet_ms: u64,
    burst_ms: u64,
    /// Whether the current burst was preceded by enough quiet.
    armed: bool,
    last_detection_ms: Option<u64>,
}

impl EnergyBurstSpotter {
    #[must_use]
    pub fn new(config: &WakewordConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_burst_ms: u64::from(config.min_burst_ms),
            min_leading_silence_ms: u64::from(config.min_leading_silence_ms),
            cooldown_ms: config.cooldown_ms,
            stream_ms: 0,
            // Start of stream counts as quiet.
            quiet_ms: u64::from(config.min_leading_silence_ms),
            burst_ms: 0,
            armed: false,
            last_detection_ms: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.last_detection_ms
            .is_some_and(|at| self.stream_ms.saturating_sub(at) < self.cooldown_ms)
    }
}

impl WakeWordSpotter for EnergyBurstSpotter {
    fn process(&mut self, frame: &AudioFrame) -> bool {
        let frame_ms = u64::try_from(frame.duration().as_millis()).unwrap_or(0);
        self.stream_ms += frame_ms;

        if frame.rms() <= self.threshold {
            self.quiet_ms += frame_ms;
            self.burst_ms = 0;
            self.armed = false;
            return false;
        }

        if self.burst_ms == 0 {
            self.armed = self.quiet_ms >= self.min_leading_silence_ms;
        }
        self.quiet_ms = 0;
        self.burst_ms += frame_ms;

        if !self.armed || self.burst_ms < self.min_burst_ms || self.in_cooldown() {
            return false;
        }

        // One detection per burst.
        self.armed = false;
        self.last_detection_ms = Some(self.stream_ms);
        debug!(stream_ms = self.stream_ms, burst_ms = self.burst_ms, "wake word detected");
        true
    }

    fn reset(&mut self) {
        self.burst_ms = 0;
        self.armed = false;
        self.quiet_ms = 0;
    }
}
