//! Delivery retry with exponential backoff.
//!
//! [`RetryState`] is a small state machine kept on every notification. It is
//! advanced by the router after each failed attempt and never touches the
//! transport.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};

/// Backoff settings for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
    /// Total attempts, including the first, before giving up.
    pub max_attempts: u32,
    /// Random jitter as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Checks that the policy can make progress.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRetryPolicy` for a zero attempt count, a
    /// multiplier below 1, jitter outside `0.0..=1.0` or a maximum below the
    /// initial backoff.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AlertError::InvalidRetryPolicy {
            reason: reason.to_string(),
        };

        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid("jitter must be between 0.0 and 1.0"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(invalid("max_backoff must not be below initial_backoff"));
        }
        Ok(())
    }

    /// Delay after the given failed attempt, without jitter.
    ///
    /// Attempt 1 waits `initial_backoff`, each later attempt multiplies it,
    /// and the result is capped at `max_backoff`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_backoff.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(delay_millis).min(self.max_backoff)
    }

    /// Delay after the given failed attempt with random jitter added.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(factor)
    }
}

/// What the router should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the time (Unix milliseconds) has passed.
    RetryAt(i64),
    /// The attempt budget is spent.
    GiveUp,
}

/// Attempt count and next eligible time of one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time of the next attempt, in Unix milliseconds.
    pub next_eligible_at: Option<i64>,
}

impl RetryState {
    /// Returns true if an attempt may be made at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: i64) -> bool {
        self.next_eligible_at.is_none_or(|at| now >= at)
    }

    /// Records the start of an attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.next_eligible_at = None;
    }

    /// Records a failed attempt and schedules the next one.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: i64) -> RetryDecision {
        if self.attempts >= policy.max_attempts {
            self.next_eligible_at = None;
            return RetryDecision::GiveUp;
        }
        let delay = policy.jittered_delay(self.attempts);
        let at = now.saturating_add(delay.as_millis() as i64);
        self.next_eligible_at = Some(at);
        RetryDecision::RetryAt(at)
    }

    /// Number of attempts after the first.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
