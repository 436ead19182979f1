//! Worker-fault retry policy

use std::time::Duration;

/// How a job interrupted by a worker fault is retried
///
/// Attempt `n` (1-based) waits `initial_backoff * multiplier^(n-1)`, capped at
/// `max_backoff`. After `max_retries` retries the job fails for good.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Whether retry number `attempt` (1-based) is still within budget
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            anyhow::bail!("retry multiplier must be a finite number >= 1.0");
        }
        if self.max_backoff < self.initial_backoff {
            anyhow::bail!("max_backoff must not be smaller than initial_backoff");
        }
        Ok(())
    }
}
