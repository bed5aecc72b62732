use std::time::Duration;

use getset::Getters;
use rand::Rng;

/// Delay progression between attempts. The wrapped duration is the base
/// delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * attempts`
    Linear(Duration),
    /// `base * 2^(attempts - 1)`
    Exponential(Duration),
}

impl Backoff {
    fn delay(&self, attempts: u32) -> Duration {
        match self {
            Backoff::Fixed(base) => *base,
            Backoff::Linear(base) => base.checked_mul(attempts).unwrap_or(Duration::MAX),
            Backoff::Exponential(base) => {
                // Cap the exponent so huge attempt counts saturate instead
                // of overflowing.
                let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(31));
                base.checked_mul(factor).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// Decides whether and when a failed job runs again.
///
/// A policy is a pure value: the same `(attempts, kind)` inputs always
/// produce the same decision, up to the optional jitter. `max_attempts` is
/// inclusive: a job whose attempts counter has reached it is not retried.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Option<Duration>,
    /// Allow-list of retryable error kinds; `None` retries every kind
    retryable_kinds: Option<Vec<String>>,
}

impl Default for RetryPolicy {
    /// A single attempt: the first failure is final.
    fn default() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            jitter: None,
            retryable_kinds: None,
        }
    }

    /// Add up to `jitter` of uniformly distributed extra delay to every
    /// retry, spreading out herds of jobs failing together.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Restrict retries to failures carrying one of the given kinds.
    /// Failures without a kind are then never retried.
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Delay before the next run, given the attempts count after the
    /// failure. `None` once `attempts` has reached `max_attempts`.
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }

        let mut delay = self.backoff.delay(attempts);
        if let Some(jitter) = self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
            delay = delay
                .checked_add(Duration::from_millis(jitter_ms))
                .unwrap_or(Duration::MAX);
        }
        Some(delay)
    }

    /// Full decision for a regular failure: the kind allow-list first, then
    /// the attempts budget.
    pub fn retry_decision(&self, attempts: u32, kind: Option<&str>) -> Option<Duration> {
        if let Some(kinds) = &self.retryable_kinds {
            match kind {
                Some(kind) if kinds.iter().any(|k| k == kind) => {}
                _ => return None,
            }
        }

        self.delay_for(attempts)
    }
}
