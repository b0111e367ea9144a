// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Mergeable sketches for cross-shard aggregation: a centroid digest for
//! percentiles and a HyperLogLog for cardinality. Both serialize with serde
//! so shards can ship partials to the coordinator.

use serde::{Deserialize, Serialize};

use crate::utils::hash::Fnv64a;

const DIGEST_MAX_CENTROIDS: usize = 128;

/// Fixed-accuracy quantile digest: keeps at most [`DIGEST_MAX_CENTROIDS`]
/// weighted centroids, merging the closest neighbors past that bound.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantileDigest {
    // (mean, weight), kept sorted by mean
    centroids: Vec<(f64, u64)>,
    count: u64,
}

impl QuantileDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn add(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        let pos = self
            .centroids
            .partition_point(|(mean, _)| *mean < value);
        self.centroids.insert(pos, (value, 1));
        self.count += 1;
        if self.centroids.len() > DIGEST_MAX_CENTROIDS * 2 {
            self.compress();
        }
    }

    pub fn merge(&mut self, other: &QuantileDigest) {
        for (mean, weight) in &other.centroids {
            let pos = self.centroids.partition_point(|(m, _)| *m < *mean);
            self.centroids.insert(pos, (*mean, *weight));
        }
        self.count += other.count;
        if self.centroids.len() > DIGEST_MAX_CENTROIDS {
            self.compress();
        }
    }

    /// Estimate the q-quantile, q in [0, 1].
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let mut digest = self.clone();
        digest.compress();
        let target = q.clamp(0.0, 1.0) * (self.count as f64);
        let mut seen = 0.0;
        for (mean, weight) in &digest.centroids {
            seen += *weight as f64;
            if seen >= target {
                return Some(*mean);
            }
        }
        digest.centroids.last().map(|(mean, _)| *mean)
    }

    fn compress(&mut self) {
        while self.centroids.len() > DIGEST_MAX_CENTROIDS {
            // merge the pair of neighbors whose means are closest
            let mut best = 0;
            let mut best_gap = f64::MAX;
            for i in 0..self.centroids.len() - 1 {
                let gap = self.centroids[i + 1].0 - self.centroids[i].0;
                if gap < best_gap {
                    best_gap = gap;
                    best = i;
                }
            }
            let (m1, w1) = self.centroids[best];
            let (m2, w2) = self.centroids[best + 1];
            let w = w1 + w2;
            let m = (m1 * w1 as f64 + m2 * w2 as f64) / w as f64;
            self.centroids[best] = (m, w);
            self.centroids.remove(best + 1);
        }
    }
}

const HLL_REGISTERS: usize = 1 << 11; // 2048 registers, ~2.3% standard error

/// HyperLogLog distinct-count sketch. Register-wise max makes it mergeable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardinalitySketch {
    registers: Vec<u8>,
}

impl Default for CardinalitySketch {
    fn default() -> Self {
        Self::new()
    }
}

impl CardinalitySketch {
    pub fn new() -> Self {
        CardinalitySketch {
            registers: vec![0; HLL_REGISTERS],
        }
    }

    pub fn add(&mut self, value: &str) {
        let hash = Fnv64a::new().sum64(value);
        let idx = (hash as usize) & (HLL_REGISTERS - 1);
        let rest = hash >> 11;
        let rank = (rest.trailing_zeros() + 1).min(64 - 11) as u8;
        if self.registers[idx] < rank {
            self.registers[idx] = rank;
        }
    }

    pub fn merge(&mut self, other: &CardinalitySketch) {
        for (r, o) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *o > *r {
                *r = *o;
            }
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;
        // small-range correction (linear counting)
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_quantiles() {
        let mut d = QuantileDigest::new();
        for i in 1..=1000 {
            d.add(i as f64);
        }
        let p50 = d.quantile(0.5).unwrap();
        assert!((p50 - 500.0).abs() < 50.0, "p50={p50}");
        let p99 = d.quantile(0.99).unwrap();
        assert!((p99 - 990.0).abs() < 30.0, "p99={p99}");
    }

    #[test]
    fn test_digest_merge_matches_union() {
        let mut a = QuantileDigest::new();
        let mut b = QuantileDigest::new();
        let mut all = QuantileDigest::new();
        for i in 0..500 {
            a.add(i as f64);
            all.add(i as f64);
        }
        for i in 500..1000 {
            b.add(i as f64);
            all.add(i as f64);
        }
        a.merge(&b);
        assert_eq!(a.count(), all.count());
        let merged = a.quantile(0.5).unwrap();
        let direct = all.quantile(0.5).unwrap();
        assert!((merged - direct).abs() < 60.0);
    }

    #[test]
    fn test_cardinality_estimate() {
        let mut sketch = CardinalitySketch::new();
        for i in 0..10_000 {
            sketch.add(&format!("user-{i}"));
        }
        let est = sketch.estimate();
        let err = (est as f64 - 10_000.0).abs() / 10_000.0;
        assert!(err < 0.1, "estimate {est} off by {err}");
    }

    #[test]
    fn test_cardinality_merge() {
        let mut a = CardinalitySketch::new();
        let mut b = CardinalitySketch::new();
        for i in 0..1000 {
            a.add(&format!("a-{i}"));
            b.add(&format!("a-{i}")); // full overlap
        }
        let solo = a.estimate();
        a.merge(&b);
        assert_eq!(a.estimate(), solo);
    }
}
