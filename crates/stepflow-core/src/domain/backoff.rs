//! Backoff for transient transport failures (e.g. a full queue on publish).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    #[serde(default)]
    pub jitter: bool,
}

impl Backoff {
    /// 3 attempts, 50ms, doubling.
    pub fn default_publish() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before the next attempt, after `attempts` failed ones (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let mut delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        if self.jitter {
            delay_secs *= rand::thread_rng().gen_range(0.5..=1.0);
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::default_publish()
    }
}
