//! Streaming speech-to-text adapter.
//!
//! Providers implement [`Transcriber`]: they consume a live frame feed and
//! push partial and final [`TranscriptEvent`]s as audio arrives.
//!
//! [`TranscriberAdapter`] adds what every session needs on top of a raw
//! provider: admission through the shared STT [`WorkerPool`], a copy of the
//! segment's frames so a failed attempt can be replayed to the fallback
//! provider, and cooperative cancellation.

use crate::config::ProviderPoolConfig;
use crate::error::{BuddyError, Result};
use crate::pipeline::messages::{AudioFrame, SessionId, TranscriptEvent};
use crate::pipeline::pool::{AdmissionError, WorkerPool};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Audio handed to a transcription provider for one segment.
#[derive(Debug)]
pub struct SegmentFeed {
    pub session_id: SessionId,
    /// Frames in capture order; closed at end of speech.
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// A streaming speech-to-text provider.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Transcribe `feed` until it closes, sending partials as they become
    /// available and exactly one final event at the end.
    ///
    /// Implementations should stop early once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `BuddyError::Transcription` when the provider fails.
    async fn transcribe(
        &self,
        feed: SegmentFeed,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Pool-gated transcriber with a fallback provider.
pub struct TranscriberAdapter {
    primary: Arc<dyn Transcriber>,
    fallback: Option<Arc<dyn Transcriber>>,
    pool: Arc<WorkerPool>,
    retries: u32,
    feed_capacity: usize,
    fallback_count: AtomicU32,
}

impl std::fmt::Debug for TranscriberAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriberAdapter")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|p| p.name().to_owned()))
            .field("retries", &self.retries)
            .field("fallback_count", &self.fallback_count())
            .finish()
    }
}

impl TranscriberAdapter {
    /// `feed_capacity` bounds the frames buffered per segment.
    #[must_use]
    pub fn new(
        primary: Arc<dyn Transcriber>,
        fallback: Option<Arc<dyn Transcriber>>,
        pool: Arc<WorkerPool>,
        config: &ProviderPoolConfig,
        feed_capacity: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            pool,
            retries: config.fallback_retries,
            feed_capacity: feed_capacity.max(1),
            fallback_count: AtomicU32::new(0),
        }
    }

    /// Number of times a fallback attempt was started.
    pub fn fallback_count(&self) -> u32 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// The shared STT pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Frames buffered per segment before new ones are dropped.
    #[must_use]
    pub fn feed_capacity(&self) -> usize {
        self.feed_capacity
    }

    fn provider_for(&self, attempt: u32) -> Arc<dyn Transcriber> {
        if attempt == 0 {
            return Arc::clone(&self.primary);
        }
        Arc::clone(self.fallback.as_ref().unwrap_or(&self.primary))
    }

    /// Transcribe one segment.
    ///
    /// Waits for a pool worker first, then streams `frames` to the provider.
    /// If the provider fails, the frames seen so far are replayed to the
    /// fallback and the live feed continues into it. Returns once a provider
    /// finishes, every attempt has failed, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// `BuddyError::Overloaded` if the pool stays saturated past its wait
    /// bound; `BuddyError::Transcription` once every attempt has failed.
    pub async fn stream(
        &self,
        session_id: SessionId,
        mut frames: mpsc::Receiver<AudioFrame>,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _permit = tokio::select! {
            permit = self.pool.acquire(session_id) => permit.map_err(admission_error)?,
            () = cancel.cancelled() => return Ok(()),
        };

        let mut buffered: Vec<AudioFrame> = Vec::new();
        let mut upstream_open = true;
        let mut attempt = 0_u32;
        let (mut relay, mut handle) =
            self.start_attempt(attempt, session_id, &buffered, upstream_open, &events, &cancel);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    handle.abort();
                    debug!(session_id = %session_id, "transcription cancelled");
                    return Ok(());
                }
                joined = &mut handle => {
                    let error = match joined {
                        Ok(Ok(())) => return Ok(()),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("transcriber task failed: {e}"),
                    };
                    if attempt >= self.retries {
                        return Err(BuddyError::Transcription(error));
                    }
                    attempt += 1;
                    self.fallback_count.fetch_add(1, Ordering::Relaxed);
                    let next = self.provider_for(attempt);
                    warn!(
                        session_id = %session_id,
                        primary = self.primary.name(),
                        fallback = next.name(),
                        replayed_frames = buffered.len(),
                        error = %error,
                        "transcriber failed, replaying segment to fallback"
                    );
                    (relay, handle) =
                        self.start_attempt(attempt, session_id, &buffered, upstream_open, &events, &cancel);
                }
                frame = frames.recv(), if upstream_open => {
                    match frame {
                        Some(frame) => {
                            if buffered.len() < self.feed_capacity {
                                buffered.push(frame.clone());
                            }
                            if let Some(tx) = relay.as_ref() && tx.try_send(frame).is_err() {
                                debug!(session_id = %session_id, "transcriber feed full, frame dropped");
                            }
                        }
                        None => {
                            upstream_open = false;
                            relay = None;
                        }
                    }
                }
            }
        }
    }

    /// Spawn one provider attempt, pre-loaded with the frames seen so far.
    ///
    /// Returns the live relay sender (`None` once upstream has closed) and
    /// the task handle.
    fn start_attempt(
        &self,
        attempt: u32,
        session_id: SessionId,
        replay: &[AudioFrame],
        upstream_open: bool,
        events: &mpsc::Sender<TranscriptEvent>,
        cancel: &CancellationToken,
    ) -> (Option<mpsc::Sender<AudioFrame>>, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        for frame in replay {
            if tx.try_send(frame.clone()).is_err() {
                break;
            }
        }
        let provider = self.provider_for(attempt);
        let events = events.clone();
        let cancel = cancel.child_token();
        let handle = tokio::spawn(async move {
            provider
                .transcribe(
                    SegmentFeed {
                        session_id,
                        frames: rx,
                    },
                    events,
                    cancel,
                )
                .await
        });
        let relay = upstream_open.then_some(tx);
        (relay, handle)
    }
}

pub(crate) fn admission_error(e: AdmissionError) -> BuddyError {
    BuddyError::Overloaded(e.to_string())
}
