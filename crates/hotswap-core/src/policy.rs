use std::time::Duration;

use anyhow::{anyhow, Result};

/// Bounded retry schedule for lock-contended file operations.
///
/// The delay before retry `n` (1-based) is
/// `initial_delay * backoff_factor^(n - 1)`; there is no cap besides
/// `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.0;

    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Result<Self> {
        if max_attempts == 0 {
            return Err(anyhow!("retry max_attempts must be at least 1"));
        }
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(anyhow!(
                "retry backoff_factor must be a finite number >= 1.0, got {backoff_factor}"
            ));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_factor,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Every delay the executor may sleep, one per attempt.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_after_attempt(attempt))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            backoff_factor: Self::DEFAULT_BACKOFF_FACTOR,
        }
    }
}
