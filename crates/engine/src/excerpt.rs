//! Waveform excerpting
//!
//! Extracting waveforms is the most expensive step of generation, so large
//! clusters only materialize an excerpt: `k = n_spikes_max / excerpt_size`
//! contiguous groups of `excerpt_size` spikes, spread evenly over the
//! cluster's ascending spike list.
//!
//! | Cluster size | Materialized |
//! |--------------|--------------|
//! | `n <= n_spikes_max` | every spike |
//! | `k == 1` | the first `excerpt_size` spikes |
//! | otherwise | groups at positions `i * step`, `step = max((n - size) / (k - 1), size)` |
//!
//! Groups never overlap, so the excerpt is strictly ascending and holds at
//! most `k * excerpt_size <= n_spikes_max` spikes.

use clusterstore_core::{Result, SpikeId, StoreError};

/// Excerpt sizing for one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcerptPolicy {
    n_spikes_max: usize,
    excerpt_size: usize,
}

impl ExcerptPolicy {
    /// Create a policy
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `excerpt_size` is zero or larger than
    /// `n_spikes_max`.
    pub fn new(n_spikes_max: usize, excerpt_size: usize) -> Result<Self> {
        if excerpt_size == 0 || excerpt_size > n_spikes_max {
            return Err(StoreError::InvalidConfig(format!(
                "excerpt size {} must be in 1..={}",
                excerpt_size, n_spikes_max
            )));
        }
        Ok(Self {
            n_spikes_max,
            excerpt_size,
        })
    }

    /// Maximum spikes materialized per cluster
    pub fn n_spikes_max(&self) -> usize {
        self.n_spikes_max
    }

    /// Spikes per group
    pub fn excerpt_size(&self) -> usize {
        self.excerpt_size
    }

    /// Number of groups for a large cluster
    pub fn n_excerpts(&self) -> usize {
        self.n_spikes_max / self.excerpt_size
    }

    /// Positions (into a cluster's spike list of length `n`) to materialize
    pub fn positions(&self, n: usize) -> Vec<usize> {
        if n <= self.n_spikes_max {
            return (0..n).collect();
        }
        let size = self.excerpt_size;
        let k = self.n_excerpts();
        if k == 1 {
            return (0..size.min(n)).collect();
        }
        let step = ((n - size) / (k - 1)).max(size);
        let mut positions = Vec::with_capacity(k * size);
        for i in 0..k {
            let start = i * step;
            if start >= n {
                break;
            }
            positions.extend(start..(start + size).min(n));
        }
        positions
    }

    /// Materialized subset of an ascending spike list
    pub fn apply(&self, spikes: &[SpikeId]) -> Vec<SpikeId> {
        if spikes.len() <= self.n_spikes_max {
            return spikes.to_vec();
        }
        self.positions(spikes.len())
            .into_iter()
            .map(|p| spikes[p])
            .collect()
    }
}
