// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deadlines, publish retries, throttling and the kind worker pool.
//!
//! - [`with_timeout`]: bounds every backend call; expiry becomes [`ReplayError::Timeout`]
//! - [`PublishRetry`]: doubling backoff between attempts at one notification batch
//! - [`RateLimiter`]: governor token bucket over notification batches
//! - [`WorkerPool`]: caps how many kinds are replayed at once, across all jobs
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), replay_engine::resilience::PoolClosed> {
//! use replay_engine::resilience::{RateLimitConfig, RateLimiter, WorkerPool};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let pool = WorkerPool::new(4);
//! let _slot = pool.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplayError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Await `fut`, failing with [`ReplayError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            crate::metrics::record_backend_timeout(operation);
            Err(ReplayError::timeout(operation))
        }
    }
}

// =============================================================================
// Publish retries
// =============================================================================

/// How often a notification batch is attempted and how long to wait between
/// attempts. The wait doubles after every failure, up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRetry {
    /// Attempts per batch, the first one included. Never zero.
    pub max_attempts: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl PublishRetry {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Millisecond waits, for tests.
    pub fn fast(max_attempts: usize) -> Self {
        Self {
            first_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            ..Self::new(max_attempts)
        }
    }

    /// Wait after the `failed`-th failed attempt (1-based).
    pub fn delay_after(&self, failed: usize) -> Duration {
        let doublings = u32::try_from(failed.saturating_sub(1)).unwrap_or(u32::MAX);
        2u32.checked_pow(doublings)
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Token bucket settings: `refill_rate` tokens per second, up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 100 batches/sec with a burst of 20.
    fn default() -> Self {
        Self {
            burst_size: 20,
            refill_rate: 100,
        }
    }
}

/// Token bucket rate limiter over notification batches.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// The pool was closed for shutdown before a slot was handed out.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker pool closed ({size} slots)")]
pub struct PoolClosed {
    pub size: usize,
}

/// Slots for kind tasks. A kind holds its slot from first page to terminal
/// state; kinds without a slot wait, still QUEUED.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, PoolClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed { size: self.size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop handing out slots; current and future waiters get [`PoolClosed`].
    pub fn close(&self) {
        self.slots.close();
    }
}
