//! Selection helpers
//!
//! Views receive a selection as an ordered list of cluster ids. The order
//! matters downstream (colour and depth are assigned by position), so every
//! helper here works in caller order and exposes the cluster-relative index of
//! each spike as a flat vector for batched array code.

use crate::error::{Result, StoreError};
use crate::spike_index::SpikesPerCluster;
use crate::types::{ClusterId, SpikeId};
use rustc_hash::FxHashMap;

/// Spikes of an ordered cluster selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionIndex {
    /// Selected clusters, in caller order
    pub clusters: Vec<ClusterId>,
    /// Concatenated spikes, cluster by cluster in caller order
    pub spikes: Vec<SpikeId>,
    /// Position in `clusters` of each spike's cluster
    pub spike_clusters_rel: Vec<usize>,
}

impl SelectionIndex {
    /// Number of selected spikes
    pub fn len(&self) -> usize {
        self.spikes.len()
    }

    /// Check if the selection holds no spikes
    pub fn is_empty(&self) -> bool {
        self.spikes.is_empty()
    }
}

/// Concatenate per-cluster spike lists in caller order
///
/// # Errors
///
/// `InvalidQuery` if a cluster is unknown.
pub fn concat_in_order(spc: &SpikesPerCluster, clusters: &[ClusterId]) -> Result<Vec<SpikeId>> {
    let total = clusters
        .iter()
        .map(|c| spc.get(c).map_or(0, |v| v.len()))
        .sum();
    let mut spikes = Vec::with_capacity(total);
    for cluster in clusters {
        let list = spc
            .get(cluster)
            .ok_or_else(|| StoreError::InvalidQuery(format!("unknown cluster {}", cluster)))?;
        spikes.extend_from_slice(list);
    }
    Ok(spikes)
}

/// Build the selection index of an ordered cluster list
///
/// # Errors
///
/// `InvalidQuery` if a cluster is unknown or repeated.
pub fn select(spc: &SpikesPerCluster, clusters: &[ClusterId]) -> Result<SelectionIndex> {
    check_unique(clusters)?;
    let spikes = concat_in_order(spc, clusters)?;
    let mut rel = Vec::with_capacity(spikes.len());
    for (i, cluster) in clusters.iter().enumerate() {
        let n = spc.get(cluster).map_or(0, |v| v.len());
        rel.extend(std::iter::repeat(i).take(n));
    }
    Ok(SelectionIndex {
        clusters: clusters.to_vec(),
        spikes,
        spike_clusters_rel: rel,
    })
}

/// Position of each spike's cluster within `cluster_order`
///
/// # Errors
///
/// `InvalidQuery` if a spike is out of range or its cluster is not in the
/// order.
pub fn relative_cluster_index(
    spike_clusters: &[ClusterId],
    spikes: &[SpikeId],
    cluster_order: &[ClusterId],
) -> Result<Vec<usize>> {
    let positions: FxHashMap<ClusterId, usize> = cluster_order
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i))
        .collect();
    spikes
        .iter()
        .map(|&spike| {
            let cluster = spike_clusters.get(spike).ok_or_else(|| {
                StoreError::InvalidQuery(format!("spike {} out of range", spike))
            })?;
            positions.get(cluster).copied().ok_or_else(|| {
                StoreError::InvalidQuery(format!(
                    "spike {} belongs to cluster {} outside the selection",
                    spike, cluster
                ))
            })
        })
        .collect()
}

fn check_unique(clusters: &[ClusterId]) -> Result<()> {
    let mut seen = rustc_hash::FxHashSet::default();
    for cluster in clusters {
        if !seen.insert(*cluster) {
            return Err(StoreError::InvalidQuery(format!(
                "cluster {} selected twice",
                cluster
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spike_index::SpikeIndex;

    fn index() -> SpikeIndex {
        SpikeIndex::build(&[5, 3, 5, 9, 3, 5]).unwrap()
    }

    #[test]
    fn test_concat_keeps_caller_order() {
        let index = index();
        let spikes = concat_in_order(index.spikes_per_cluster(), &[5, 3]).unwrap();
        assert_eq!(spikes, vec![0, 2, 5, 1, 4]);
    }

    #[test]
    fn test_concat_unknown_cluster() {
        let index = index();
        let err = concat_in_order(index.spikes_per_cluster(), &[5, 42]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }

    #[test]
    fn test_select_relative_index() {
        let index = index();
        let sel = select(index.spikes_per_cluster(), &[9, 5]).unwrap();
        assert_eq!(sel.spikes, vec![3, 0, 2, 5]);
        assert_eq!(sel.spike_clusters_rel, vec![0, 1, 1, 1]);
        assert_eq!(sel.len(), 4);
    }

    #[test]
    fn test_select_rejects_duplicates() {
        let index = index();
        assert!(select(index.spikes_per_cluster(), &[5, 5]).is_err());
    }

    #[test]
    fn test_relative_cluster_index() {
        let index = index();
        let rel = relative_cluster_index(index.spike_clusters(), &[4, 0, 1], &[5, 3]).unwrap();
        assert_eq!(rel, vec![1, 0, 1]);

        let err = relative_cluster_index(index.spike_clusters(), &[3], &[5, 3]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
        assert!(relative_cluster_index(index.spike_clusters(), &[60], &[5]).is_err());
    }
}
