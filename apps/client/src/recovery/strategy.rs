use rand::Rng;
use serde::Serialize;

use super::classify::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    Exponential,
    Linear,
    Fibonacci,
}

/// Fixed retry policy for one error class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub curve: BackoffCurve,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter: f64,
}

impl RetryStrategy {
    pub fn for_class(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Network => Self {
                max_attempts: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                multiplier: 2.0,
                curve: BackoffCurve::Exponential,
                jitter: 0.1,
            },
            ErrorClass::Timeout => Self {
                max_attempts: 3,
                base_delay_ms: 2_000,
                max_delay_ms: 60_000,
                multiplier: 2.0,
                curve: BackoffCurve::Exponential,
                jitter: 0.2,
            },
            ErrorClass::Quota => Self {
                max_attempts: 3,
                base_delay_ms: 60_000,
                max_delay_ms: 300_000,
                multiplier: 1.0,
                curve: BackoffCurve::Linear,
                jitter: 0.1,
            },
            ErrorClass::Validation => Self {
                max_attempts: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
                multiplier: 1.0,
                curve: BackoffCurve::Linear,
                jitter: 0.0,
            },
            ErrorClass::Processing => Self {
                max_attempts: 4,
                base_delay_ms: 1_500,
                max_delay_ms: 20_000,
                multiplier: 1.0,
                curve: BackoffCurve::Fibonacci,
                jitter: 0.15,
            },
            ErrorClass::Unknown => Self {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
                curve: BackoffCurve::Exponential,
                jitter: 0.1,
            },
        }
    }

    /// `attempt_number` is the attempt about to be made; the first retry is attempt 2.
    pub fn allows(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    /// Delay before `attempt_number`, without jitter, capped at `max_delay_ms`.
    pub fn base_delay(&self, attempt_number: u32) -> u64 {
        let retry_index = attempt_number.saturating_sub(2);
        let raw = match self.curve {
            BackoffCurve::Exponential => {
                self.base_delay_ms as f64 * self.multiplier.powi(retry_index as i32)
            }
            BackoffCurve::Linear => self.base_delay_ms as f64 * f64::from(retry_index + 1),
            BackoffCurve::Fibonacci => self.base_delay_ms as f64 * fibonacci(retry_index + 1) as f64,
        };
        (raw.min(self.max_delay_ms as f64)).max(0.0) as u64
    }

    /// Base delay plus a random extra of up to `jitter` of it.
    pub fn delay_with_jitter(&self, attempt_number: u32) -> u64 {
        let base = self.base_delay(attempt_number);
        if self.jitter <= 0.0 || base == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter) * base as f64;
        base + extra as u64
    }
}

/// 1, 1, 2, 3, 5, ...
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
