//! Reconnect schedule
//!
//! **Backoff Strategy:**
//! - Delay after N consecutive failures: `min(base_delay * 2^N, max_delay)`
//! - Counter resets when a transport opens
//! - After `max_attempts` scheduled reconnects have failed, give up

use std::time::Duration;

use costlink_common::config::ReconnectConfig;

/// Consecutive-failure counter with exponential delay
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(config: &ReconnectConfig, failures: u32) -> Duration {
        let scaled = 2u32
            .checked_pow(failures)
            .and_then(|factor| config.base_delay.checked_mul(factor))
            .unwrap_or(config.max_delay);
        scaled.min(config.max_delay)
    }

    /// Count a failure and return the delay before the next attempt
    ///
    /// Returns `None` once `max_attempts` reconnects have been used up.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.config.max_attempts {
            None
        } else {
            Some(Self::delay_for(&self.config, self.failures))
        }
    }

    /// Forget previous failures (transport opened)
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
