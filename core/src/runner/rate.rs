//! Iteration rate limiting

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::time::Duration;

/// Caps user iterations per second across every user of one runner
///
/// Token bucket via governor with a burst of one, so sub-1 rates such as
/// 0.5/s are honored exactly. Shared between user tasks through an `Arc`.
pub struct IterationRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    rate: Option<f64>,
}

impl IterationRateLimiter {
    /// Create a limiter; `None`, a non-positive rate or one too small for a
    /// `Duration` period disables it
    ///
    /// # Examples
    /// ```
    /// use loadhive_core::runner::IterationRateLimiter;
    ///
    /// let limiter = IterationRateLimiter::new(Some(50.0));
    /// assert!(limiter.is_enabled());
    ///
    /// let unlimited = IterationRateLimiter::new(None);
    /// assert!(!unlimited.is_enabled());
    /// ```
    pub fn new(rate: Option<f64>) -> Self {
        let limiter = rate.and_then(|per_sec| {
            if !per_sec.is_finite() || per_sec <= 0.0 {
                return None;
            }
            let period = Duration::try_from_secs_f64(1.0 / per_sec).ok()?;
            let quota = Quota::with_period(period)?;
            Some(RateLimiter::direct(quota))
        });

        Self { limiter, rate }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Wait until the next iteration is allowed
    pub async fn wait(&self) {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Whether a limit is in force
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Configured iterations per second
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }
}

impl Default for IterationRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl std::fmt::Debug for IterationRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationRateLimiter")
            .field("rate", &self.rate)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_for_invalid_rates() {
        for rate in [None, Some(0.0), Some(-3.0), Some(f64::NAN), Some(1e-30)] {
            let limiter = IterationRateLimiter::new(rate);
            assert!(!limiter.is_enabled());
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn test_burst_of_one() {
        let limiter = IterationRateLimiter::new(Some(0.5));
        assert!(limiter.is_enabled());
        assert_eq!(limiter.rate(), Some(0.5));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_spaces_iterations() {
        let limiter = IterationRateLimiter::new(Some(100.0));
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.wait().await;
        }
        // First permit is free, the other four are 10ms apart
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn test_debug() {
        let debug = format!("{:?}", IterationRateLimiter::new(Some(20.0)));
        assert!(debug.contains("IterationRateLimiter"));
        assert!(debug.contains("20.0"));
    }
}
