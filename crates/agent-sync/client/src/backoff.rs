//! Reconnect and retry delay policies.

use std::time::Duration;

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt - 1), max)` for a 1-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self.base_ms.max(1);
        let scaled = base.saturating_mul(1_u64 << exponent);
        Duration::from_millis(scaled.min(self.max_ms.max(base)))
    }
}

/// Next step after a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Counts consecutive failed sessions.
#[derive(Debug, Clone, Default)]
pub struct ReconnectTracker {
    policy: BackoffPolicy,
    failures: u32,
}

impl ReconnectTracker {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_open(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) -> ReconnectStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts.max(1) {
            return ReconnectStep::GiveUp {
                attempts: self.failures,
            };
        }
        ReconnectStep::Retry {
            attempt: self.failures,
            delay: self.policy.delay_for(self.failures),
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Delay before retry number `attempt` (0-based) of a user action.
#[must_use]
pub fn action_retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(16))
}
