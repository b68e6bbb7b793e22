//! Delay strategies between respawn attempts after a worker crash.
//!
//! Respawning is retried without limit; a [`RespawnBackoff`] only decides how
//! long to wait before each retry. Callers wanting a bounded number of
//! attempts layer that policy on top.

use std::fmt::Debug;
use std::time::Duration;

/// Default delay between respawn attempts.
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Strategy for the delay before respawn attempt `attempt + 1`.
pub trait RespawnBackoff: Send + Sync + Debug {
    /// Delay after `attempt` consecutive failures (0-indexed).
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Retry immediately. Intended for tests.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RESPAWN_DELAY)
    }
}

impl RespawnBackoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Delay growing as `first × factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(250),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RespawnBackoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
