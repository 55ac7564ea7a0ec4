//! See [`RttEstimator`].

use web_time::Duration;

/// Default initial RTT assumed before any samples have arrived, as
/// recommended by [RFC 9002 Section 6.2.2].
///
/// [RFC 9002 Section 6.2.2]: https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.2-1
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Computes an RTT estimation for a network path from packet
/// acknowledgements.
///
/// Samples are folded into an exponential moving average (the smoothing
/// scheme used by `quinn-proto`) rather than overwriting the estimate
/// directly; [`RttEstimator::latest`] exposes the raw last sample for
/// callers that want it unsmoothed.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
}

impl RttEstimator {
    /// Creates a new estimator from a given initial RTT.
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// Gets the current best (smoothed) RTT estimation.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Gets the most recent raw RTT sample.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Gets the minimum RTT registered so far.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Adds an RTT sample to this estimation.
    pub fn update(&mut self, rtt: Duration) {
        self.latest = rtt;
        self.min = self.min.min(rtt);

        let var_sample = if self.smoothed > rtt {
            self.smoothed - rtt
        } else {
            rtt - self.smoothed
        };
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + rtt) / 8;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_pulls_toward_samples() {
        let mut rtt = RttEstimator::new(Duration::from_millis(800));
        for _ in 0..64 {
            rtt.update(Duration::from_millis(40));
        }
        assert_eq!(Duration::from_millis(40), rtt.latest());
        assert!(rtt.get() < Duration::from_millis(50));
        assert!(rtt.get() >= Duration::from_millis(40));
    }

    #[test]
    fn min_tracks_lowest_sample() {
        let mut rtt = RttEstimator::new(Duration::from_millis(500));
        rtt.update(Duration::from_millis(750));
        assert_eq!(Duration::from_millis(500), rtt.min());
        rtt.update(Duration::from_millis(250));
        assert_eq!(Duration::from_millis(250), rtt.min());
    }
}
