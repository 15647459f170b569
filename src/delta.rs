//! Inter-arrival delta tracking per timestamp clock domain (hardware or
//! software). Negative deltas are clock anomalies: dropped from statistics,
//! counted, and the reference still advances so tracking resumes cleanly.

use nix::sys::time::TimeSpec;

#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: Option<i64>,
    anomalies: u64,
}

impl DeltaTracker {
    pub fn new() -> Self {
        DeltaTracker::default()
    }

    /// Feed the next raw timestamp for this clock domain.
    ///
    /// Returns the non-negative delta to the previous timestamp, or `None`
    /// when there is no previous timestamp yet or the clock stepped backward.
    /// In every case the stored reference advances to `timestamp_ns`.
    pub fn update(&mut self, timestamp_ns: i64) -> Option<u64> {
        let previous = self.previous.replace(timestamp_ns)?;

        let delta = saturate_to_i64(i128::from(timestamp_ns) - i128::from(previous));
        if delta < 0 {
            self.anomalies += 1;
            return None;
        }
        Some(delta as u64)
    }

    /// Number of backward-stepping timestamps seen so far.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

/// Nanoseconds since the clock's epoch, saturating at the i64 range instead
/// of wrapping (tv_sec is 64-bit on modern kernels).
pub fn timespec_to_nanos(time: &TimeSpec) -> i64 {
    let nanos =
        i128::from(time.tv_sec()) * 1_000_000_000 + i128::from(time.tv_nsec());
    saturate_to_i64(nanos)
}

fn saturate_to_i64(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_timestamp_yields_no_delta() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.update(1_000_000), None);
    }

    #[test]
    fn forward_steps_yield_deltas() {
        let mut tracker = DeltaTracker::new();
        let base = 5_000_000_000;
        assert_eq!(tracker.update(base), None);
        assert_eq!(tracker.update(base + 500), Some(500));
        assert_eq!(tracker.update(base + 500), Some(0));
    }

    #[test]
    fn backward_step_is_dropped_but_reference_advances() {
        let mut tracker = DeltaTracker::new();
        let base = 1_700_000_000_000_000_000;
        assert_eq!(tracker.update(base), None);
        assert_eq!(tracker.update(base + 500), Some(500));
        // Clock stepped backward: no observation, one anomaly.
        assert_eq!(tracker.update(base + 300), None);
        assert_eq!(tracker.anomalies(), 1);
        // Delta is computed from the anomalous timestamp, proving the
        // reference advanced despite the dropped delta.
        assert_eq!(tracker.update(base + 800), Some(500));
        assert_eq!(tracker.anomalies(), 1);
    }

    #[test]
    fn extreme_jumps_saturate_instead_of_wrapping() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.update(i64::MIN), None);
        assert_eq!(tracker.update(i64::MAX), Some(i64::MAX as u64));
        // And the reverse jump is an anomaly, not an overflow.
        assert_eq!(tracker.update(i64::MIN), None);
        assert_eq!(tracker.anomalies(), 1);
    }

    #[test]
    fn timespec_conversion_saturates() {
        let ts = TimeSpec::new(12, 345);
        assert_eq!(timespec_to_nanos(&ts), 12_000_000_345);

        let huge = TimeSpec::new(i64::MAX, 999_999_999);
        assert_eq!(timespec_to_nanos(&huge), i64::MAX);

        let negative = TimeSpec::new(i64::MIN, 0);
        assert_eq!(timespec_to_nanos(&negative), i64::MIN);
    }
}
