use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reconnect pacing for the realtime socket. CRUD calls never retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    /// Extra random delay, as a fraction of the computed step.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

/// Exponential delay sequence; `reset` after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self.step(self.failures);
        self.failures = self.failures.saturating_add(1);
        step + jitter_for(step, self.policy.jitter)
    }

    fn step(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(20)).unwrap_or(u32::MAX);
        self.policy
            .initial
            .saturating_mul(factor)
            .min(self.policy.ceiling)
    }
}

fn jitter_for(step: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || step.is_zero() {
        return Duration::ZERO;
    }
    let spread = step.mul_f64(ratio).as_millis() as u64;
    if spread == 0 {
        return Duration::ZERO;
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(seed % (spread + 1))
}
