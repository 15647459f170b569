//! Running latency aggregation: min/max with originating iteration, sum,
//! count, a P² median estimate and a fixed five-bucket exponential histogram.
//! No raw samples are retained.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::quantile::QuantileEstimator;

pub const BUCKET_COUNT: usize = 5;
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MICRO: u64 = 1_000;

/// Point-in-time copy of a recorder's state. This is the only contract the
/// presentation layer may depend on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub min_index: Option<u64>,
    pub max_index: Option<u64>,
    pub observations: u64,
    pub median: f64,
    pub target: u64,
    pub bucket_width: u64,
    pub buckets: [u64; BUCKET_COUNT],
}

impl Default for LatencySnapshot {
    fn default() -> Self {
        LatencySnapshot {
            min: u64::MAX,
            max: 0,
            sum: 0,
            min_index: None,
            max_index: None,
            observations: 0,
            median: 0.0,
            target: 0,
            bucket_width: 0,
            buckets: [0; BUCKET_COUNT],
        }
    }
}

impl LatencySnapshot {
    pub fn mean(&self) -> f64 {
        if self.observations == 0 {
            return 0.0;
        }
        self.sum as f64 / self.observations as f64
    }
}

/// Single-producer/single-consumer snapshot cell. The recorder overwrites the
/// whole value under a short-lived lock and the reporter clones it out, so a
/// concurrent reader can never observe a half-written snapshot.
#[derive(Default)]
pub struct SnapshotCell {
    slot: Mutex<LatencySnapshot>,
}

impl SnapshotCell {
    pub fn publish(&self, snapshot: LatencySnapshot) {
        *self.slot.lock().unwrap() = snapshot;
    }

    pub fn load(&self) -> LatencySnapshot {
        self.slot.lock().unwrap().clone()
    }
}

/// Bucket index for a non-negative deviation from the target.
///
/// `bit_width(difference / width)` clamped to the last bucket, giving
/// exponentially widening buckets: [0,w), [w,2w), [2w,4w), [4w,8w), [8w,∞).
pub fn bucket_index(difference: u64, bucket_width: u64) -> usize {
    debug_assert!(bucket_width > 0);
    let deviations = difference / bucket_width;
    let width = (u64::BITS - deviations.leading_zeros()) as usize;
    width.min(BUCKET_COUNT - 1)
}

pub struct LatencyRecorder {
    min: u64,
    max: u64,
    sum: u64,
    min_index: Option<u64>,
    max_index: Option<u64>,
    observations: u64,
    median: QuantileEstimator,
    target: u64,
    bucket_width: u64,
    buckets: [u64; BUCKET_COUNT],
    upload: Option<Arc<SnapshotCell>>,
}

impl LatencyRecorder {
    /// `target` is subtracted from each observation before bucketing (the
    /// sender's nominal period, or zero for absolute values). `bucket_width`
    /// must be non-zero.
    pub fn new(target: u64, bucket_width: u64, upload: Option<Arc<SnapshotCell>>) -> Self {
        LatencyRecorder {
            min: u64::MAX,
            max: 0,
            sum: 0,
            min_index: None,
            max_index: None,
            observations: 0,
            median: QuantileEstimator::new(0.50),
            target,
            bucket_width,
            buckets: [0; BUCKET_COUNT],
            upload,
        }
    }

    pub fn add_observation(&mut self, observation: u64, index: u64) {
        self.observations += 1;
        self.sum += observation;
        self.median.add_observation(observation as f64);

        // Strict comparisons: the earliest occurrence of an extreme keeps its
        // index, later ties do not re-trigger.
        if observation < self.min {
            self.min = observation;
            self.min_index = Some(index);
        }
        if observation > self.max {
            self.max = observation;
            self.max_index = Some(index);
        }

        let difference = observation.saturating_sub(self.target);
        self.buckets[bucket_index(difference, self.bucket_width)] += 1;

        if let Some(cell) = &self.upload {
            cell.publish(self.snapshot());
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            min: self.min,
            max: self.max,
            sum: self.sum,
            min_index: self.min_index,
            max_index: self.max_index,
            observations: self.observations,
            median: self.median.quantile(),
            target: self.target,
            bucket_width: self.bucket_width,
            buckets: self.buckets,
        }
    }
}
