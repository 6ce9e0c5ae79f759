use std::time::Duration;

use rand::Rng;

/// Maps a retry attempt number (1-based) to the delay before the next try.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay(k) = min(base * 2^(k-1), max)
    Exponential { base: Duration, max: Duration },
    /// delay(k) = min(base * k, max)
    Linear { base: Duration, max: Duration },
    /// delay(k) = base
    Fixed { base: Duration },
}

impl BackoffStrategy {
    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffStrategy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                base.saturating_mul(factor).min(max)
            }
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(max),
            BackoffStrategy::Fixed { base } => base,
        }
    }

    /// Delay with bounded random jitter added (up to 25% of the base delay),
    /// so concurrent retries don't stampede in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let jitter_cap = base.as_millis() as u64 / 4;
        if jitter_cap == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

/// Bounded retry policy shared by the action executor and workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first try. Must be >= 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::Fixed {
                base: Duration::ZERO,
            },
        }
    }

    /// Whether another attempt is allowed after `attempt` tries have run.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
