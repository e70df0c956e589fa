//! Retry/timeout policy: pure decisions about what happens after an attempt.

use std::time::Duration;

/// How an attempt ended, as far as retry decisions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The test ran to completion and passed.
    Passed,
    /// The test ran to completion and reported a failure (assertion, thrown
    /// error inside the test body). Deterministic, never retried.
    TestFailed,
    /// The test could not be run: runner crash, browser launch failure,
    /// lost process. Transient.
    InfraFailed,
    /// The attempt exceeded its deadline.
    TimedOut,
}

/// Outcome class derived from a [`Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    Retryable,
    Fatal,
}

impl Verdict {
    pub fn class(&self) -> OutcomeClass {
        match self {
            Verdict::Passed => OutcomeClass::Success,
            Verdict::InfraFailed | Verdict::TimedOut => OutcomeClass::Retryable,
            Verdict::TestFailed => OutcomeClass::Fatal,
        }
    }
}

/// Output of [`RetryPolicy::decide`]. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub next_deadline: Option<Duration>,
}

impl RetryDecision {
    fn terminal() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            next_deadline: None,
        }
    }
}

/// Exponential backoff: `min(base * 2^(n-1), cap)` after attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}

/// Retry and timeout configuration for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Backoff,
    /// Time a cancelled runner gets to exit before it is hard-killed.
    pub kill_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff: Backoff {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Same policy with the per-execution overrides applied.
    pub fn with_overrides(&self, max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
            ..*self
        }
    }

    /// Decide what to do after attempt `attempt` (1-based) ended with `verdict`.
    ///
    /// Reaching `max_attempts` is always terminal.
    pub fn decide(&self, verdict: Verdict, attempt: u32) -> RetryDecision {
        match verdict.class() {
            OutcomeClass::Success | OutcomeClass::Fatal => RetryDecision::terminal(),
            OutcomeClass::Retryable if attempt >= self.max_attempts => RetryDecision::terminal(),
            OutcomeClass::Retryable => RetryDecision {
                retry: true,
                delay: self.backoff.delay_after(attempt),
                next_deadline: Some(self.attempt_timeout),
            },
        }
    }

    /// Longest time an execution can legitimately spend in `running`.
    ///
    /// Every attempt may use its full deadline plus the kill grace, followed by
    /// the largest backoff.
    pub fn watchdog_bound(&self, slack: Duration) -> Duration {
        let per_attempt = self
            .attempt_timeout
            .saturating_add(self.kill_grace)
            .saturating_add(self.backoff.cap);
        per_attempt
            .saturating_mul(self.max_attempts.max(1))
            .saturating_add(slack)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
