//! Cluster partition of the spike set
//!
//! [`SpikeIndex`] maps every cluster id to the ascending list of spikes it
//! owns. It is derived from the flat `spike_clusters[spike] -> cluster` array
//! in a single counting pass and never mutated afterwards: an assignment
//! change builds a new index and [`SpikeIndex::diff`] reports which ids the
//! change touched.
//!
//! ## Invariants
//!
//! - Every spike belongs to exactly one cluster.
//! - Concatenating the per-cluster lists and sorting recovers `0..n_spikes`.
//! - Spike ids within a cluster are strictly ascending.

use crate::error::{Result, StoreError};
use crate::types::{ClusterId, SpikeId};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Ordered spike ids per cluster
///
/// BTreeMap so that iteration over clusters is deterministic and ascending.
pub type SpikesPerCluster = BTreeMap<ClusterId, Vec<SpikeId>>;

/// Immutable cluster -> spikes partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpikeIndex {
    spike_clusters: Vec<ClusterId>,
    spikes_per_cluster: SpikesPerCluster,
}

/// Cluster ids touched by an assignment change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDelta {
    /// Ids present before and absent now
    pub removed: Vec<ClusterId>,
    /// Ids absent before and present now
    pub added: Vec<ClusterId>,
    /// Ids present in both whose spike set differs
    pub changed: Vec<ClusterId>,
}

impl AssignmentDelta {
    /// Old ids whose cached entries are no longer valid
    pub fn invalidated(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self
            .removed
            .iter()
            .chain(self.changed.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Check if the change touched nothing
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

impl SpikeIndex {
    /// Build the index from a raw assignment array
    ///
    /// # Errors
    ///
    /// `InvalidAssignment` if `spike_clusters` is empty or holds a negative id.
    pub fn build(spike_clusters: &[i64]) -> Result<Self> {
        if spike_clusters.is_empty() {
            return Err(StoreError::InvalidAssignment(
                "spike_clusters is empty".to_string(),
            ));
        }
        let mut assignment = Vec::with_capacity(spike_clusters.len());
        for (spike, &cluster) in spike_clusters.iter().enumerate() {
            if cluster < 0 {
                return Err(StoreError::InvalidAssignment(format!(
                    "spike {} has negative cluster id {}",
                    spike, cluster
                )));
            }
            assignment.push(cluster as ClusterId);
        }
        Self::from_assignment(assignment)
    }

    /// Build the index from an already-validated assignment
    ///
    /// # Errors
    ///
    /// `InvalidAssignment` if the assignment is empty.
    pub fn from_assignment(spike_clusters: Vec<ClusterId>) -> Result<Self> {
        if spike_clusters.is_empty() {
            return Err(StoreError::InvalidAssignment(
                "spike_clusters is empty".to_string(),
            ));
        }

        // Pass 1: counts, so each bucket is allocated exactly once.
        let mut counts: FxHashMap<ClusterId, usize> = FxHashMap::default();
        for &cluster in &spike_clusters {
            *counts.entry(cluster).or_insert(0) += 1;
        }

        // Pass 2: fill buckets in spike order, which keeps them ascending.
        let mut buckets: FxHashMap<ClusterId, Vec<SpikeId>> = counts
            .into_iter()
            .map(|(cluster, n)| (cluster, Vec::with_capacity(n)))
            .collect();
        for (spike, cluster) in spike_clusters.iter().enumerate() {
            if let Some(bucket) = buckets.get_mut(cluster) {
                bucket.push(spike);
            }
        }

        Ok(Self {
            spike_clusters,
            spikes_per_cluster: buckets.into_iter().collect(),
        })
    }

    /// Total number of spikes
    pub fn n_spikes_total(&self) -> usize {
        self.spike_clusters.len()
    }

    /// Number of clusters
    pub fn n_clusters(&self) -> usize {
        self.spikes_per_cluster.len()
    }

    /// Cluster ids in ascending order
    pub fn clusters(&self) -> Vec<ClusterId> {
        self.spikes_per_cluster.keys().copied().collect()
    }

    /// Check if a cluster exists
    pub fn contains(&self, cluster: ClusterId) -> bool {
        self.spikes_per_cluster.contains_key(&cluster)
    }

    /// Spikes of one cluster, ascending
    pub fn spikes(&self, cluster: ClusterId) -> Option<&[SpikeId]> {
        self.spikes_per_cluster.get(&cluster).map(|v| v.as_slice())
    }

    /// Number of spikes in one cluster (0 for unknown ids)
    pub fn n_spikes(&self, cluster: ClusterId) -> usize {
        self.spikes_per_cluster.get(&cluster).map_or(0, |v| v.len())
    }

    /// Owning cluster of a spike
    pub fn cluster_of(&self, spike: SpikeId) -> Option<ClusterId> {
        self.spike_clusters.get(spike).copied()
    }

    /// The raw assignment array
    pub fn spike_clusters(&self) -> &[ClusterId] {
        &self.spike_clusters
    }

    /// The full partition
    pub fn spikes_per_cluster(&self) -> &SpikesPerCluster {
        &self.spikes_per_cluster
    }

    /// Ascending union of the spikes of several clusters
    ///
    /// Unknown cluster ids contribute nothing.
    pub fn spikes_in_clusters(&self, clusters: &[ClusterId]) -> Vec<SpikeId> {
        let mut spikes: Vec<SpikeId> = clusters
            .iter()
            .filter_map(|c| self.spikes_per_cluster.get(c))
            .flat_map(|v| v.iter().copied())
            .collect();
        spikes.sort_unstable();
        spikes.dedup();
        spikes
    }

    /// Compare with a newer index
    pub fn diff(&self, newer: &SpikeIndex) -> AssignmentDelta {
        let mut delta = AssignmentDelta::default();
        for (cluster, spikes) in &self.spikes_per_cluster {
            match newer.spikes_per_cluster.get(cluster) {
                None => delta.removed.push(*cluster),
                Some(new_spikes) if new_spikes != spikes => delta.changed.push(*cluster),
                Some(_) => {}
            }
        }
        for cluster in newer.spikes_per_cluster.keys() {
            if !self.spikes_per_cluster.contains_key(cluster) {
                delta.added.push(*cluster);
            }
        }
        delta
    }
}
