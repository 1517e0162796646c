//! Retry/backoff policy.
//!
//! A pure decision function: given a failure classification and the number of
//! attempts made so far, either grant a retry after an exponential delay or
//! declare the job exhausted.

use std::fmt;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Failure classification reported by a stage executor.
///
/// The orchestrator never reclassifies; it only applies the policy to
/// whatever class it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Network timeout, external rate limit, temporary storage outage, lost lease.
    Transient,
    /// Invalid credentials, content removed, validation failure.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            _ => Err(format!("Unknown error class: {s}")),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(TimeDelta),
    Exhausted,
}

/// Exponential backoff: `delay = base * 2^attempts`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
    /// Attempt cap given to newly created jobs.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: TimeDelta::seconds(30),
            max_delay: TimeDelta::hours(1),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: TimeDelta, max_delay: TimeDelta, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `attempts` counts every attempt made so far, including the one that
    /// just failed. Permanent failures are exhausted regardless of the count.
    pub fn decide(&self, class: ErrorClass, attempts: u32, max_attempts: u32) -> RetryDecision {
        if class == ErrorClass::Permanent || attempts >= max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempts))
    }

    /// Backoff delay after `attempts` failures.
    pub fn delay_for_attempt(&self, attempts: u32) -> TimeDelta {
        let base_ms = self.base_delay.num_milliseconds().max(0);
        let factor = 2i64.saturating_pow(attempts);
        let delay_ms = base_ms.saturating_mul(factor);
        let delay = TimeDelta::try_milliseconds(delay_ms).unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}
