//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use offsync_common::{Error, Result};

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default number of pending items pulled per batch.
    pub batch_size: usize,
    /// Maximum number of items worked on at once.
    pub max_concurrency: usize,
    /// Deadline for one item's unit of work, in milliseconds.
    pub item_timeout_ms: u64,
    /// Age after which a `Processing` claim is considered stuck, in seconds.
    pub stale_after_secs: u64,
    /// Interval between scheduled batches, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 4,
            item_timeout_ms: 5_000,
            stale_after_secs: 300,
            poll_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Set the default batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the worker concurrency limit.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the per-item deadline.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the stuck-claim age threshold.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after_secs = age.as_secs();
        self
    }

    /// Set the scheduled batch interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Check the configuration for unusable values.
    ///
    /// # Errors
    /// - Zero batch size, concurrency, timeout or poll interval
    /// - Stale threshold shorter than the item timeout
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput("max_concurrency must be positive".to_string()));
        }
        if self.item_timeout_ms == 0 {
            return Err(Error::InvalidInput("item_timeout_ms must be positive".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::InvalidInput("poll_interval_secs must be positive".to_string()));
        }
        if self.stale_after() < self.item_timeout() {
            return Err(Error::InvalidInput(
                "stale_after_secs must not be shorter than item_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}
