//! Busy-retry with coordinated backoff.
//!
//! Every task of a merge run shares one [`ContentionGauge`]. Each retrying task
//! raises it on every other busy response, and every task scales its jittered
//! sleep by the current level, so all writers slow down together as lock
//! contention rises.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{MergeError, Result};
use crate::observability::metrics;

/// Limits for retrying a statement that hit lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit, multiplied by the contention level
    pub base_delay: Duration,
    /// Attempts before giving up, including the first
    pub max_attempts: u32,
    /// Wall-clock budget across all attempts
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_attempts: 500,
            max_elapsed: Duration::from_secs(30 * 60),
        }
    }
}

/// Shared contention level. Starts at 1 and only grows.
#[derive(Debug)]
pub struct ContentionGauge {
    level: AtomicU64,
}

impl Default for ContentionGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentionGauge {
    pub fn new() -> Self {
        Self {
            level: AtomicU64::new(1),
        }
    }

    /// Raise the level by one, returning the new level.
    pub fn raise(&self) -> u64 {
        self.level.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn level(&self) -> u64 {
        self.level.load(Ordering::SeqCst)
    }
}

/// Retry driver shared by all tasks of a merge group.
///
/// The retry count is per driver; the contention gauge may be shared across
/// drivers so that later groups start from the level earlier ones reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    contention: Arc<ContentionGauge>,
    retries: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self::with_gauge(policy, Arc::new(ContentionGauge::new()), cancel)
    }

    /// A driver that raises and reads an existing `contention` gauge.
    pub fn with_gauge(
        policy: RetryPolicy,
        contention: Arc<ContentionGauge>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            contention,
            retries: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub fn contention_level(&self) -> u64 {
        self.contention.level()
    }

    /// Busy responses retried so far, across all tasks.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Jittered delay for `level`: uniform over `[0, base_delay * level]`.
    pub fn delay_for(&self, level: u64) -> Duration {
        let base_ms = u64::try_from(self.policy.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = base_ms.saturating_mul(level);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `op` until it stops reporting busy, the budget runs out, or the
    /// run is cancelled. Non-busy errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }

            attempts += 1;
            let err = match op().await {
                Err(e) if e.is_busy() => e,
                other => return other,
            };

            if attempts % 2 == 1 {
                self.contention.raise();
            }
            self.retries.fetch_add(1, Ordering::SeqCst);
            metrics::record_busy_retry();

            let elapsed = started.elapsed();
            if attempts >= self.policy.max_attempts || elapsed >= self.policy.max_elapsed {
                tracing::warn!(context, attempts, ?elapsed, error = %err, "giving up on busy database");
                return Err(MergeError::EngineBusy {
                    context: context.to_string(),
                    attempts,
                    elapsed,
                });
            }

            let level = self.contention.level();
            let delay = self.delay_for(level);
            tracing::debug!(context, level, ?delay, "database busy, waiting");

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MergeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
