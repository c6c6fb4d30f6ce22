//! Streaming text-to-speech adapter.
//!
//! Providers implement [`Synthesizer`] and stream [`AudioFrame`]s for a piece
//! of text. [`SynthesizerAdapter`] gates them through the shared TTS
//! [`WorkerPool`] and retries a failed synthesis against the fallback
//! provider. A retry resynthesizes the whole utterance but only forwards the
//! frames past what the client already received, so no audio repeats within
//! a turn.

use crate::config::ProviderPoolConfig;
use crate::error::{BuddyError, Result};
use crate::pipeline::messages::{AudioFrame, SessionId};
use crate::pipeline::pool::{WorkerPermit, WorkerPool};
use crate::stt::admission_error;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A streaming text-to-speech provider.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Synthesize `text`, sending frames in playback order.
    ///
    /// Implementations should check `cancel` between frames and return
    /// early once it fires.
    ///
    /// # Errors
    ///
    /// Returns `BuddyError::Synthesis` when the provider fails.
    async fn synthesize(
        &self,
        text: &str,
        frames: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Pool-gated synthesizer with a fallback provider.
pub struct SynthesizerAdapter {
    primary: Arc<dyn Synthesizer>,
    fallback: Option<Arc<dyn Synthesizer>>,
    pool: Arc<WorkerPool>,
    retries: u32,
    fallback_count: AtomicU32,
}

impl std::fmt::Debug for SynthesizerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesizerAdapter")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|p| p.name().to_owned()))
            .field("retries", &self.retries)
            .field("fallback_count", &self.fallback_count())
            .finish()
    }
}

impl SynthesizerAdapter {
    #[must_use]
    pub fn new(
        primary: Arc<dyn Synthesizer>,
        fallback: Option<Arc<dyn Synthesizer>>,
        pool: Arc<WorkerPool>,
        config: &ProviderPoolConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            pool,
            retries: config.fallback_retries,
            fallback_count: AtomicU32::new(0),
        }
    }

    pub fn fallback_count(&self) -> u32 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Reserve a TTS worker, waiting at most the pool's admission bound.
    ///
    /// The controller admits before entering synthesis so a saturated pool
    /// degrades to a text-only reply instead of a failed turn.
    ///
    /// # Errors
    ///
    /// `BuddyError::Overloaded` when the pool is saturated.
    pub async fn admit(&self, session_id: SessionId) -> Result<WorkerPermit> {
        self.pool.acquire(session_id).await.map_err(admission_error)
    }

    /// Synthesize `text` on an already admitted worker.
    ///
    /// # Errors
    ///
    /// `BuddyError::Synthesis` once the primary and every retry have failed.
    pub async fn speak(
        &self,
        _permit: WorkerPermit,
        session_id: SessionId,
        text: &str,
        frames: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0_u32;
        let mut delivered = 0_usize;
        loop {
            let provider = if attempt == 0 {
                &self.primary
            } else {
                self.fallback.as_ref().unwrap_or(&self.primary)
            };
            let (tx, mut rx) = mpsc::channel(frames.max_capacity().max(1));
            let skip = delivered;
            let out = &frames;
            let forward = async move {
                let mut index = 0_usize;
                let mut sent = skip;
                while let Some(frame) = rx.recv().await {
                    index += 1;
                    if index <= skip {
                        continue;
                    }
                    if out.send(frame).await.is_err() {
                        break;
                    }
                    sent = index;
                }
                sent
            };
            let (result, sent) =
                tokio::join!(provider.synthesize(text, tx, cancel.child_token()), forward);
            delivered = delivered.max(sent);
            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return Ok(());
            }
            if attempt >= self.retries {
                return Err(BuddyError::Synthesis(error.to_string()));
            }
            attempt += 1;
            self.fallback_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %session_id,
                primary = self.primary.name(),
                fallback = self.fallback.as_ref().map_or("primary", |p| p.name()),
                error = %error,
                delivered,
                "synthesizer failed, retrying on fallback"
            );
        }
    }
}
