//! Backoff functionality.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use std::time::Duration;

/// Deterministic exponential backoff.
///
/// Every round doubles the delay (more generally multiplies it by `base`)
/// until `max_backoff` is reached. There is no jitter: retry schedules must
/// be reproducible so that throttling behavior can be asserted exactly.
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            base: 2.,
        }
    }
}

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval. The state is never reset: a request that keeps getting
/// throttled keeps waiting longer, up to the configured maximum.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Backoff {
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            next_backoff_secs: config.init_backoff.as_secs_f64(),
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let this_backoff = self.next_backoff_secs;
        let next_backoff = self.max_backoff_secs.min(this_backoff * self.base);
        self.next_backoff_secs = next_backoff;
        Duration::from_secs_f64(this_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 500.;
        let base = 3.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        let mut backoff = Backoff::new(&config);
        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }
    }

    #[test]
    fn test_default_schedule() {
        // The schedule the dispatcher relies on when retrying throttled
        // requests: doubling from 100ms, capped at 1s, never reset.
        let mut backoff = Backoff::new(&BackoffConfig::default());

        let mut observed = vec![];
        for _ in 0..6 {
            observed.push(backoff.next().as_millis());
        }
        assert_eq!(observed, vec![100, 200, 400, 800, 1000, 1000]);
    }
}
