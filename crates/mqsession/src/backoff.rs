//! Reconnect backoff schedule.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Exponential backoff with optional jitter.
///
/// Delays start at the base delay and grow by `multiplier` up to the cap.
/// Jitter spreads each delay between the current step and the next one, so
/// the sequence stays non-decreasing and within `[base, max]`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
    attempt: u32,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(
        base: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
            current: base.min(max),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_multiplier,
            config.reconnect_max_delay(),
            config.reconnect_jitter,
            config.reconnect_max_attempts,
        )
    }

    /// Number of attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt limit has been reached.
    pub fn exhausted(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<(u32, Duration)> {
        if self.exhausted() {
            return None;
        }
        self.attempt += 1;

        let scaled = (self.current.as_nanos() as f64 * self.multiplier).round();
        let next = Duration::from_nanos(scaled as u64).min(self.max);
        let mut delay = self.current;
        if self.jitter > 0.0 && next > self.current {
            let spread = (next - self.current).as_nanos() as f64 * self.jitter;
            delay += Duration::from_nanos((spread * rng.gen_range(0.0..=1.0)) as u64);
        }
        self.current = next;

        Some((self.attempt, delay))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.base.min(self.max);
    }
}
