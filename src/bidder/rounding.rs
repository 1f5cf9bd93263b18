//! Price bucketing
//!
//! CPM arrives in dollars (ex $12.50). It is matched against the rounding
//! buckets in dollars, floored to the bucket granularity, then multiplied by
//! 100. A cpm of 12.50 for a 300x250 slot yields the label `300x250_1250`.

use serde::Deserialize;

/// Every intermediate step is normalized to this many fractional units.
const PRECISION: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RoundingBucket {
    /// Inclusive `[low, high]` range in dollars.
    pub range: [f64; 2],
    pub granularity: f64,
}

impl RoundingBucket {
    pub fn new(low: f64, high: f64, granularity: f64) -> Self {
        Self { range: [low, high], granularity }
    }

    pub fn low(&self) -> f64 {
        self.range[0]
    }

    pub fn high(&self) -> f64 {
        self.range[1]
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low() && value <= self.high()
    }

    fn overlaps(&self, other: &RoundingBucket) -> bool {
        self.low() <= other.high() && other.low() <= self.high()
    }
}

/// Ordered bucket list. Earliest declared bucket wins when ranges overlap.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoundingConfiguration {
    pub buckets: Vec<RoundingBucket>,
}

impl Default for RoundingConfiguration {
    fn default() -> Self {
        Self { buckets: vec![RoundingBucket::new(0.0, f64::INFINITY, 0.01)] }
    }
}

impl RoundingConfiguration {
    pub fn new(buckets: Vec<RoundingBucket>) -> Self {
        Self { buckets }
    }

    /// Structural problems that make the configuration unusable.
    pub fn problems(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.buckets.is_empty() {
            errs.push("roundingBuckets provided is invalid: no buckets".to_string());
        }
        for (i, b) in self.buckets.iter().enumerate() {
            if b.low().is_nan() || b.high().is_nan() || b.low() > b.high() {
                errs.push(format!("roundingBuckets[{}] has an invalid range {:?}", i, b.range));
            }
            if !b.granularity.is_finite() || b.granularity <= 0.0 {
                errs.push(format!("roundingBuckets[{}] has invalid granularity {}", i, b.granularity));
            }
        }
        errs
    }

    /// Index pairs of buckets whose ranges overlap.
    pub fn overlapping_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..self.buckets.len() {
            for j in (i + 1)..self.buckets.len() {
                if self.buckets[i].overlaps(&self.buckets[j]) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Map a dollar cpm to its integer bucket label.
    pub fn bucketize(&self, value: f64) -> i64 {
        let mut cpm = normalize(value);
        let mut lowest = f64::INFINITY;
        let mut highest = 0.0_f64;

        for bucket in &self.buckets {
            if bucket.low() < lowest {
                lowest = bucket.low();
            }
            if bucket.high() > highest {
                highest = bucket.high();
            }
            if bucket.contains(cpm) {
                let g = bucket.granularity;
                cpm = normalize(cpm / g);
                cpm = normalize(cpm.floor());
                cpm = normalize(cpm * g);
                cpm = normalize(cpm * 100.0);
                return round_half_up(cpm) as i64;
            }
        }

        if cpm < lowest {
            cpm = 0.0;
        } else if cpm > highest {
            cpm = highest;
        }
        // NaN falls through both branches and saturates to 0 on the cast.
        normalize(cpm * 100.0).floor() as i64
    }
}

fn normalize(value: f64) -> f64 {
    round_half_up(value * PRECISION) / PRECISION
}

/// Rounds .5 toward positive infinity, so -2.5 becomes -2.
fn round_half_up(value: f64) -> f64 {
    let floor = value.floor();
    if value - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    }
}
