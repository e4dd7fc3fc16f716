//! Reconnect backoff for the provider link.
//!
//! Attempt `n` (zero-based) waits `initial * multiplier^n`, capped at `max`,
//! then spread by `±jitter`.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Default spread applied to every delay.
const DEFAULT_JITTER: f64 = 0.1;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any delay, before jitter.
    pub max: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Fraction of the delay used as random spread (0 disables jitter).
    pub jitter: f64,
    /// Retry budget; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}

impl BackoffConfig {
    /// Backoff described by the upstream settings.
    #[must_use]
    pub const fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial: settings.reconnect_delay_initial,
            max: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter: DEFAULT_JITTER,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Same parameters without randomness.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    #[allow(clippy::cast_precision_loss)]
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_ms = self.max.as_millis() as f64;
        let millis = (self.initial.as_millis() as f64 * self.multiplier.powi(exponent)).min(max_ms);
        millis_to_duration(millis)
    }
}

/// Retry schedule for one provider link.
///
/// ```rust
/// use std::time::Duration;
/// use price_stream_relay::infrastructure::provider::reconnect::{Backoff, BackoffConfig};
///
/// let config = BackoffConfig {
///     initial: Duration::from_millis(100),
///     max: Duration::from_millis(250),
///     multiplier: 2.0,
///     jitter: 0.0,
///     max_attempts: 3,
/// };
/// let mut backoff = Backoff::new(config);
///
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
/// assert_eq!(backoff.next_delay(), None);
///
/// backoff.reset();
/// assert_eq!(backoff.attempts(), 0);
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh schedule.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.config.base_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(self.spread(delay))
    }

    /// Forget past failures; call once a link has carried traffic.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a bounded budget has run out.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.config.max_attempts != 0 && self.attempts >= self.config.max_attempts
    }

    #[allow(clippy::cast_precision_loss)]
    fn spread(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as f64;
        let range = millis * self.config.jitter;
        let offset = rand::rng().random_range(-range..=range);
        millis_to_duration((millis + offset).max(1.0))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis_to_duration(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 {
        Duration::from_millis(millis.round() as u64)
    } else {
        Duration::ZERO
    }
}
