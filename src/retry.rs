//! Retry utilities with configurable backoff curves
//!
//! This module provides delay calculation and a generic retry helper used by
//! the supervisor (restart backoff) and the broker (per-call reconnect
//! spacing). Three curves are supported:
//!
//! - `Fixed`: the same delay every attempt (broker reconnects)
//! - `Linear`: `base × attempt` (supervisor restarts, the default)
//! - `Exponential`: `base × multiplier^attempt`, capped
//!
//! # Examples
//!
//! ```rust,no_run
//! use tool_broker::retry::{retry_with_backoff, BackoffCurve, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_base_delay(Duration::from_secs(2))
//!     .with_curve(BackoffCurve::Fixed);
//!
//! let result = retry_with_backoff(config, || async {
//!     // Your async operation here
//!     Ok::<_, tool_broker::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Delay growth strategy across attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffCurve {
    /// Same delay every attempt
    Fixed,
    /// `base × attempt` (attempt counted from 1)
    Linear,
    /// `base × multiplier^attempt`, capped at `max_delay`
    Exponential { multiplier: f64 },
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Base delay the curve scales from
    pub base_delay: Duration,

    /// Ceiling on any single delay
    pub max_delay: Duration,

    /// How the delay grows across attempts
    pub curve: BackoffCurve,

    /// Random jitter added to each delay (0.0 to 1.0 of the delay)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            curve: BackoffCurve::Linear,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with the default linear curve
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff curve
    pub fn with_curve(mut self, curve: BackoffCurve) -> Self {
        self.curve = curve;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt (counted from 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;

        let raw_ms = match self.curve {
            BackoffCurve::Fixed => base_ms,
            BackoffCurve::Linear => base_ms * attempt as f64,
            BackoffCurve::Exponential { multiplier } => {
                base_ms * multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };

        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter_factor > 0.0 {
            let jitter_range = capped_ms * self.jitter_factor;
            let jitter = rand::random::<f64>() * jitter_range;
            capped_ms + jitter - (jitter_range / 2.0)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}

/// Retry an async operation using the configured backoff.
///
/// Runs `operation` up to `config.max_attempts` times, sleeping
/// `config.delay_for(attempt)` between failures. Returns the first success,
/// or the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts.max(1) {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_error = Some(err);

                // Don't sleep after the last attempt
                if attempt < config.max_attempts {
                    sleep(config.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::config("retry ran zero attempts")))
}
