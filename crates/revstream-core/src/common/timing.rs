//! # Timing contract
//!
//! The delays below are part of the wire contract: independent client and
//! server implementations only interoperate when they agree on them.
//!
//! - [`CONTEXT_DELAY`] (`D_ctx`) - client pause between the two contexts,
//!   measured from the first send.
//! - [`FINAL_DELAY`] (`D_fin`) - server pause between the second context and
//!   the deferred revision 3.
//! - [`DECISION_MIN`] / [`DECISION_MAX`] (`T_min` / `T_max`) - inclusive
//!   bounds of the client's randomized decision window.

use core::time::Duration;
use rand::Rng;

/// Client delay between context #1 and context #2.
pub const CONTEXT_DELAY: Duration = Duration::from_millis(50);

/// Server delay between context #2 and the deferred revision 3.
pub const FINAL_DELAY: Duration = Duration::from_millis(50);

/// Lower bound of the decision window.
pub const DECISION_MIN: Duration = Duration::from_millis(30);

/// Upper bound of the decision window.
pub const DECISION_MAX: Duration = Duration::from_millis(120);

/// Revision attached to the answer to context #1.
pub const FIRST_REVISION: u32 = 1;

/// Revision of the deferred batch; the last one a well-behaved server sends.
pub const FINAL_REVISION: u32 = 3;

/// Inclusive range the client draws its decision timeout from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionWindow {
    min: Duration,
    max: Duration,
}

impl Default for DecisionWindow {
    fn default() -> Self {
        Self {
            min: DECISION_MIN,
            max: DECISION_MAX,
        }
    }
}

impl DecisionWindow {
    /// Returns `None` when `min > max`.
    pub fn new(min: Duration, max: Duration) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// A degenerate window that always yields `timeout`.
    pub const fn fixed(timeout: Duration) -> Self {
        Self {
            min: timeout,
            max: timeout,
        }
    }

    pub const fn min(&self) -> Duration {
        self.min
    }

    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Draws a timeout from the thread-local RNG.
    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::rng())
    }

    /// Draws a timeout uniformly at microsecond resolution.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let lo = self.min.as_micros() as u64;
        let hi = self.max.as_micros() as u64;
        Duration::from_micros(rng.random_range(lo..=hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn default_window_samples_stay_in_bounds() {
        let window = DecisionWindow::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..1000 {
            let t = window.sample_with(&mut rng);
            assert!(t >= DECISION_MIN && t <= DECISION_MAX, "{t:?} out of range");
        }

        for _ in 0..1000 {
            let t = window.sample();
            assert!(t >= DECISION_MIN && t <= DECISION_MAX, "{t:?} out of range");
        }
    }

    #[test]
    fn fixed_window_is_constant() {
        let window = DecisionWindow::fixed(Duration::from_millis(90));
        assert_eq!(window.sample(), Duration::from_millis(90));
        assert_eq!(window.min(), window.max());
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(DecisionWindow::new(Duration::from_millis(10), Duration::from_millis(5)).is_none());
        assert!(DecisionWindow::new(Duration::from_millis(5), Duration::from_millis(5)).is_some());
    }
}
