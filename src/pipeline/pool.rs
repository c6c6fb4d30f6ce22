//! Bounded worker pools for shared speech providers.
//!
//! Transcription and synthesis are CPU/accelerator bound and shared by every
//! session. Each provider type gets one pool. Jobs queue FIFO for a permit up
//! to `max_queue_wait`; past that the caller is told to degrade instead of
//! waiting, so one session's queueing cannot stretch another's stage latency
//! beyond that bound.

use crate::config::ProviderPoolConfig;
use crate::pipeline::messages::SessionId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Admission failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// No worker became free within the admission wait.
    #[error("{pool} pool saturated; waited {waited_ms}ms")]
    Saturated {
        /// Pool name (`stt` / `tts`).
        pool: &'static str,
        /// How long the caller queued before giving up.
        waited_ms: u64,
    },
    /// The pool was shut down.
    #[error("{pool} pool closed")]
    Closed {
        /// Pool name.
        pool: &'static str,
    },
}

/// A held worker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    /// Time spent queueing for this permit.
    pub waited: Duration,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub admitted: u64,
    pub rejected: u64,
    pub max_wait_ms: u64,
    pub in_use: usize,
}

/// FIFO worker pool with a bounded admission wait.
#[derive(Debug)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    max_queue_wait: Duration,
    semaphore: Arc<Semaphore>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    max_wait_ms: AtomicU64,
}

impl WorkerPool {
    /// Create a pool from provider configuration.
    #[must_use]
    pub fn new(name: &'static str, config: &ProviderPoolConfig) -> Self {
        Self::with_limits(name, config.pool_size, config.max_queue_wait())
    }

    /// Create a pool with explicit limits.
    #[must_use]
    pub fn with_limits(name: &'static str, size: usize, max_queue_wait: Duration) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            max_queue_wait,
            semaphore: Arc::new(Semaphore::new(size)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            max_wait_ms: AtomicU64::new(0),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured admission wait bound.
    #[must_use]
    pub fn max_queue_wait(&self) -> Duration {
        self.max_queue_wait
    }

    /// Wait for a worker, at most `max_queue_wait`.
    ///
    /// Waiters are served in arrival order (tokio's semaphore is fair).
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Saturated` when the wait bound elapses.
    pub async fn acquire(&self, session: SessionId) -> Result<WorkerPermit, AdmissionError> {
        let start = Instant::now();
        let acquired = tokio::time::timeout(
            self.max_queue_wait,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        let waited = start.elapsed();
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);

        match acquired {
            Ok(Ok(permit)) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.max_wait_ms.fetch_max(waited_ms, Ordering::Relaxed);
                debug!(pool = self.name, session_id = %session, waited_ms, "worker admitted");
                Ok(WorkerPermit {
                    _permit: permit,
                    waited,
                })
            }
            Ok(Err(_)) => Err(AdmissionError::Closed { pool: self.name }),
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(pool = self.name, session_id = %session, waited_ms, "pool saturated, degrading");
                Err(AdmissionError::Saturated {
                    pool: self.name,
                    waited_ms,
                })
            }
        }
    }

    /// Take a worker only if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Some(WorkerPermit {
            _permit: permit,
            waited: Duration::ZERO,
        })
    }

    /// Stop admitting work; queued and future acquires fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            max_wait_ms: self.max_wait_ms.load(Ordering::Relaxed),
            in_use: self.size.saturating_sub(self.semaphore.available_permits()),
        }
    }
}
