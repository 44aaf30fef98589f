use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Bounded rolling window over one metric with O(1) running statistics.
///
/// Mean and variance are maintained incrementally with Welford's update (and
/// its inverse on eviction); the sorted view needed by the median/quantile
/// detectors is recomputed lazily and invalidated on every push.
#[derive(Debug, Clone)]
pub struct StatBuffer {
    capacity: usize,
    values: VecDeque<f64>,
    timestamps: VecDeque<DateTime<Utc>>,
    sum: f64,
    sum_squares: f64,
    mean: f64,
    m2: f64,
    sorted_cache: Option<Vec<f64>>,
}

impl StatBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            timestamps: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_squares: 0.0,
            mean: 0.0,
            m2: 0.0,
            sorted_cache: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, value: f64, timestamp: DateTime<Utc>) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() == self.capacity {
            self.evict_oldest();
        }

        self.values.push_back(value);
        self.timestamps.push_back(timestamp);
        self.sum += value;
        self.sum_squares += value * value;

        // Welford forward update
        let n = self.values.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;

        self.sorted_cache = None;
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.values.pop_front() else {
            return;
        };
        self.timestamps.pop_front();
        self.sum -= oldest;
        self.sum_squares -= oldest * oldest;

        let n = self.values.len() as f64 + 1.0;
        if self.values.is_empty() {
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            // Inverse Welford update
            let new_mean = (n * self.mean - oldest) / (n - 1.0);
            self.m2 -= (oldest - self.mean) * (oldest - new_mean);
            self.mean = new_mean;
            if self.m2 < 0.0 {
                self.m2 = 0.0;
            }
        }
        self.sorted_cache = None;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance.
    pub fn variance(&self) -> f64 {
        if self.values.len() < 2 {
            0.0
        } else {
            self.m2 / (self.values.len() as f64 - 1.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_squares(&self) -> f64 {
        self.sum_squares
    }

    /// Newest sample with its timestamp.
    pub fn last(&self) -> Option<(f64, DateTime<Utc>)> {
        let v = self.values.back()?;
        let t = self.timestamps.back()?;
        Some((*v, *t))
    }

    /// The most recent `n` samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.values.len().saturating_sub(n);
        self.values.iter().skip(skip).copied().collect()
    }

    fn sorted(&mut self) -> &[f64] {
        if self.sorted_cache.is_none() {
            let mut sorted: Vec<f64> = self.values.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
            self.sorted_cache = Some(sorted);
        }
        self.sorted_cache.as_deref().expect("cache just filled")
    }

    pub fn median(&mut self) -> f64 {
        self.quantile(0.5)
    }

    /// Linear-interpolated quantile over the sorted view.
    pub fn quantile(&mut self, q: f64) -> f64 {
        let sorted = self.sorted();
        if sorted.is_empty() {
            return 0.0;
        }
        let q = q.clamp(0.0, 1.0);
        let pos = q * (sorted.len() as f64 - 1.0);
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            let frac = pos - lo as f64;
            sorted[lo] + frac * (sorted[hi] - sorted[lo])
        }
    }

    /// Median absolute deviation from the median.
    pub fn mad(&mut self) -> f64 {
        let med = self.median();
        let mut deviations: Vec<f64> = self.values.iter().map(|v| (v - med).abs()).collect();
        if deviations.is_empty() {
            return 0.0;
        }
        deviations.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
        let pos = 0.5 * (deviations.len() as f64 - 1.0);
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        if lo == hi {
            deviations[lo]
        } else {
            let frac = pos - lo as f64;
            deviations[lo] + frac * (deviations[hi] - deviations[lo])
        }
    }
}
