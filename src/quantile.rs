//! Streaming quantile estimation via the P² algorithm (Jain & Chlamtac,
//! "The P² Algorithm for Dynamic Calculation of Quantiles and Histograms
//! Without Storing Observations"). Five markers, O(1) memory and per-call
//! cost regardless of stream length.

const NUM_MARKERS: usize = 5;

pub struct QuantileEstimator {
    observations: usize,
    heights: [f64; NUM_MARKERS],
    positions: [f64; NUM_MARKERS],
    desired: [f64; NUM_MARKERS],
    desired_increments: [f64; NUM_MARKERS],
}

impl QuantileEstimator {
    /// `quantile` must be in (0, 1); 0.5 tracks the median.
    pub fn new(quantile: f64) -> Self {
        QuantileEstimator {
            observations: 0,
            heights: [0.0; NUM_MARKERS],
            positions: [0.0, 1.0, 2.0, 3.0, 4.0],
            desired: [0.0, 1.0, 2.0, 3.0, 4.0],
            desired_increments: [0.0, quantile / 2.0, quantile, (1.0 + quantile) / 2.0, 1.0],
        }
    }

    /// Current estimate of the target quantile (the middle marker height).
    ///
    /// Undefined until five observations have been ingested: it reads zero
    /// until the third observation arrives and the raw third observation
    /// after that. Callers that care must check the stream length.
    pub fn quantile(&self) -> f64 {
        self.heights[2]
    }

    pub fn add_observation(&mut self, observation: f64) {
        if self.observations < NUM_MARKERS {
            self.add_initial_observation(observation);
            return;
        }

        self.adjust_marker_positions(observation);

        self.observations += 1;

        self.adjust_marker_heights();
    }

    fn add_initial_observation(&mut self, observation: f64) {
        self.heights[self.observations] = observation;
        self.observations += 1;
        if self.observations == NUM_MARKERS {
            self.heights.sort_by(f64::total_cmp);
        }
    }

    fn adjust_marker_positions(&mut self, observation: f64) {
        let increment_bound = if observation < self.heights[0] {
            self.heights[0] = observation;
            0
        } else if observation < self.heights[1] {
            0
        } else if observation < self.heights[2] {
            1
        } else if observation < self.heights[3] {
            2
        } else if observation <= self.heights[4] {
            3
        } else {
            self.heights[4] = observation;
            3
        };

        // Markers for segments of the dataset above the observation all shift
        // one position to the right.
        for position in &mut self.positions[increment_bound + 1..] {
            *position += 1.0;
        }

        for (desired, increment) in self.desired.iter_mut().zip(&self.desired_increments) {
            *desired += increment;
        }
    }

    fn adjust_marker_heights(&mut self) {
        for index in 1..=3 {
            let difference = self.desired[index] - self.positions[index];

            // Only move a marker that drifted a full position from its
            // desired position and has room before the adjacent marker.
            if (difference >= 1.0 && self.positions[index + 1] - self.positions[index] > 1.0)
                || (difference <= -1.0 && self.positions[index - 1] - self.positions[index] < -1.0)
            {
                let increment: i32 = if difference > 0.0 { 1 } else { -1 };
                let candidate = self.parabolic(index, increment);

                if self.heights[index - 1] < candidate && candidate < self.heights[index + 1] {
                    self.heights[index] = candidate;
                } else {
                    self.heights[index] = self.linear(index, increment);
                }
                self.positions[index] += f64::from(increment);
            }
        }
    }

    fn parabolic(&self, index: usize, increment: i32) -> f64 {
        let height = self.heights[index];
        let (prev, next) = (index - 1, index + 1);
        let increment = f64::from(increment);
        let prev_position = self.positions[prev];
        let next_position = self.positions[next];
        let factor = increment / (next_position - prev_position);

        let cur_position = self.positions[index];
        let addend1 = (cur_position - prev_position + increment)
            * (self.heights[next] - height)
            / (next_position - cur_position);
        let addend2 = (next_position - cur_position - increment)
            * (height - self.heights[prev])
            / (cur_position - prev_position);
        height + factor * (addend1 + addend2)
    }

    fn linear(&self, index: usize, increment: i32) -> f64 {
        let height = self.heights[index];
        let neighbor = (index as i32 + increment) as usize;
        height
            + f64::from(increment) * (self.heights[neighbor] - height)
                / (self.positions[neighbor] - self.positions[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn heights_of(estimator: &QuantileEstimator) -> [f64; NUM_MARKERS] {
        estimator.heights
    }

    #[test]
    fn quantile_is_zero_before_enough_observations() {
        let mut estimator = QuantileEstimator::new(0.5);
        assert_eq!(estimator.quantile(), 0.0);
        estimator.add_observation(42.0);
        estimator.add_observation(7.0);
        assert_eq!(estimator.quantile(), 0.0);
    }

    #[test]
    fn initial_markers_are_sorted_after_fifth_observation() {
        let mut estimator = QuantileEstimator::new(0.5);
        for value in [9.0, 1.0, 7.0, 3.0, 5.0] {
            estimator.add_observation(value);
        }
        assert_eq!(heights_of(&estimator), [1.0, 3.0, 5.0, 7.0, 9.0]);
        assert_eq!(estimator.quantile(), 5.0);
    }

    #[test]
    fn marker_heights_stay_sorted_for_any_input_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut estimator = QuantileEstimator::new(0.9);
        for _ in 0..10_000 {
            estimator.add_observation(rng.random::<f64>() * 1e6);
            let heights = heights_of(&estimator);
            for window in heights.windows(2) {
                assert!(
                    window[0] <= window[1],
                    "marker heights out of order: {heights:?}"
                );
            }
        }
    }

    #[test]
    fn median_converges_on_uniform_stream() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut estimator = QuantileEstimator::new(0.5);
        for _ in 0..100_000 {
            estimator.add_observation(rng.random::<f64>());
        }
        let median = estimator.quantile();
        assert!(
            (median - 0.5).abs() < 0.005,
            "median estimate {median} not within 1% of 0.5"
        );
    }

    #[test]
    fn upper_quantile_converges_on_uniform_stream() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut estimator = QuantileEstimator::new(0.95);
        for _ in 0..100_000 {
            estimator.add_observation(rng.random::<f64>());
        }
        let quantile = estimator.quantile();
        assert!(
            (quantile - 0.95).abs() < 0.01,
            "p95 estimate {quantile} too far from 0.95"
        );
    }

    #[test]
    fn extremes_replace_end_markers() {
        let mut estimator = QuantileEstimator::new(0.5);
        for value in [10.0, 20.0, 30.0, 40.0, 50.0] {
            estimator.add_observation(value);
        }
        estimator.add_observation(1.0);
        assert_eq!(heights_of(&estimator)[0], 1.0);
        estimator.add_observation(99.0);
        assert_eq!(heights_of(&estimator)[4], 99.0);
    }
}
