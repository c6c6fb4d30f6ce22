//! Always-on device frontend.
//!
//! One task per connected device. It outlives individual turns: it converts
//! frames to the pipeline format, runs the wake word spotter, and forwards
//! everything else to the device's session task.

use crate::config::AudioConfig;
use crate::pipeline::controller::SessionInput;
use crate::pipeline::messages::{AudioFrame, DeviceInput, SessionId, TriggerKind};
use crate::wakeword::WakeWordSpotter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frontend for one device connection.
pub struct AudioFrontend {
    session_id: SessionId,
    audio: AudioConfig,
    spotter: Option<Box<dyn WakeWordSpotter>>,
}

impl AudioFrontend {
    /// `spotter` is `None` when wake word detection is disabled.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        audio: AudioConfig,
        spotter: Option<Box<dyn WakeWordSpotter>>,
    ) -> Self {
        Self {
            session_id,
            audio,
            spotter,
        }
    }

    /// Pump device input into the session until the device or the session
    /// goes away, or `cancel` fires.
    pub async fn run(
        mut self,
        mut device: mpsc::Receiver<DeviceInput>,
        session: mpsc::Sender<SessionInput>,
        cancel: CancellationToken,
    ) {
        info!(session_id = %self.session_id, "device frontend started");
        loop {
            let input = tokio::select! {
                () = cancel.cancelled() => break,
                input = device.recv() => input,
            };
            let Some(input) = input else {
                let _ = session.send(SessionInput::Disconnect).await;
                break;
            };
            let forwarded = match input {
                DeviceInput::Audio(frame) => {
                    let frame = normalize_frame(frame, &self.audio);
                    if self.spotter.as_mut().is_some_and(|s| s.process(&frame)) {
                        info!(session_id = %self.session_id, seq = frame.seq, "wake word detected");
                        session.send(SessionInput::Trigger(TriggerKind::WakeWord)).await
                    } else {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            session.try_send(SessionInput::Audio(frame))
                        {
                            debug!(session_id = %self.session_id, "session busy, audio frame dropped");
                        }
                        if session.is_closed() {
                            break;
                        }
                        Ok(())
                    }
                }
                DeviceInput::PushToTalk => {
                    if let Some(spotter) = self.spotter.as_mut() {
                        spotter.reset();
                    }
                    session
                        .send(SessionInput::Trigger(TriggerKind::PushToTalk))
                        .await
                }
                DeviceInput::Text(text) => session.send(SessionInput::Text(text)).await,
                DeviceInput::CaptureError(message) => {
                    warn!(session_id = %self.session_id, error = %message, "device capture error");
                    let _ = session.send(SessionInput::CaptureError(message)).await;
                    break;
                }
                DeviceInput::Disconnect => {
                    let _ = session.send(SessionInput::Disconnect).await;
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
        info!(session_id = %self.session_id, "device frontend stopped");
    }
}

/// Convert a device frame to the configured channel count and sample rate.
#[must_use]
pub fn normalize_frame(frame: AudioFrame, target: &AudioConfig) -> AudioFrame {
    if frame.channels == target.channels && frame.sample_rate == target.sample_rate {
        return frame;
    }
    let mut frame = frame;
    if target.channels == 1 && frame.channels > 1 {
        frame.samples = to_mono(&frame.samples, frame.channels);
        frame.channels = 1;
    }
    if frame.sample_rate != target.sample_rate && frame.sample_rate != 0 {
        frame.samples = resample(&frame.samples, frame.sample_rate, target.sample_rate);
        frame.sample_rate = target.sample_rate;
    }
    frame
}

/// Average interleaved channels down to mono.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech band audio.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            match samples.get(idx + 1) {
                Some(next) => (f64::from(samples[idx]) * (1.0 - frac) + f64::from(*next) * frac) as f32,
                None => samples[idx.min(samples.len() - 1)],
            }
        })
        .collect()
}
