//! Exponential backoff with jitter
//!
//! Used by [`ServerPool`](crate::servers::ServerPool) to space out reconnects after
//! a connection dies. The delay grows from `initial_delay` by `backoff_multiplier`
//! per consecutive failure up to `max_delay`, and resets on a successful connect.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Stateful backoff for one server
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    failures: u32,
}

impl Backoff {
    /// Start at the configured minimum
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial_delay;
        Self {
            config,
            next,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before reconnecting
    pub fn fail(&mut self) -> Duration {
        self.failures += 1;
        let base = self.next;
        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.config.backoff_multiplier);
        self.next = grown.min(self.config.max_delay);

        let delay = if self.config.jitter {
            add_jitter(base)
        } else {
            base
        };
        delay.min(self.config.max_delay)
    }

    /// Back to the minimum after a successful connect
    pub fn reset(&mut self) {
        self.next = self.config.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Swap in new settings (server reconfigured); keeps the failure count
    pub fn reconfigure(&mut self, config: BackoffConfig) {
        self.next = self.next.clamp(config.initial_delay, config.max_delay);
        self.config = config;
    }
}

/// Jitter uniformly between 0% and 100% of `delay`, so the result lies in `[delay, 2 * delay]`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
