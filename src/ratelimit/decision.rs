//! Per-request verdicts and the policy applied when the store cannot answer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the limiter decides when the counter store fails, times out, or the
/// caller cancels before an answer arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through with the full quota reported as remaining.
    #[default]
    Open,
    /// Reject the request with nothing remaining.
    Closed,
}

/// The verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// The class limit the request was counted against
    pub limit: u64,
    /// When the window is expected to reset
    pub reset_at: DateTime<Utc>,
    /// Name of the limit class that was applied
    pub class: String,
    /// Set when the store could not be consulted and the failure policy
    /// produced this verdict
    pub degraded: bool,
}

impl Decision {
    /// Build a decision from the counter value after this request's increment.
    pub fn from_count(count: u64, limit: u64, reset_at: DateTime<Utc>, class: &str) -> Self {
        Self {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            limit,
            reset_at,
            class: class.to_string(),
            degraded: false,
        }
    }

    /// Build the decision dictated by `policy` when no count is available.
    pub fn degraded(policy: FailurePolicy, limit: u64, reset_at: DateTime<Utc>, class: &str) -> Self {
        let (allowed, remaining) = match policy {
            FailurePolicy::Open => (true, limit),
            FailurePolicy::Closed => (false, 0),
        };

        Self {
            allowed,
            remaining,
            limit,
            reset_at,
            class: class.to_string(),
            degraded: true,
        }
    }

    /// Time left until `reset_at`, measured from `now`.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
