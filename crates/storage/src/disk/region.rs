//! In-memory index of per-cluster regions in one chunk file
//!
//! A region is the ordered list of `Data` extents holding one cluster's rows.
//! Extents of different clusters interleave in the file because generation
//! appends chunk by chunk. A region becomes loadable once sealed.

use crate::format::RECORD_HEADER_SIZE;
use clusterstore_core::ClusterId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `Data` record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Offset of the record header in the chunk file
    pub offset: u64,
    /// Rows in the record
    pub n_rows: u32,
}

/// All extents of one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Extents in row order
    pub extents: Vec<Extent>,
    /// Total rows across extents
    pub n_rows: u64,
    /// Set once a `Seal` record confirmed the region complete
    pub sealed: bool,
    /// Spike-id digest recorded by the seal
    pub digest: u32,
}

impl Region {
    /// Bytes the region occupies in the chunk file, seal included
    pub fn bytes(&self, row_len: usize) -> u64 {
        let headers = self.extents.len() as u64 + u64::from(self.sealed);
        headers * RECORD_HEADER_SIZE as u64 + self.n_rows * row_len as u64 * 4
    }
}

/// Region index of one field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionIndex {
    regions: BTreeMap<ClusterId, Region>,
}

impl RegionIndex {
    /// Any region (sealed or not) of a cluster
    pub fn region(&self, cluster: ClusterId) -> Option<&Region> {
        self.regions.get(&cluster)
    }

    /// The sealed region of a cluster
    pub fn sealed(&self, cluster: ClusterId) -> Option<&Region> {
        self.regions.get(&cluster).filter(|r| r.sealed)
    }

    /// Append an extent to a cluster's open region
    ///
    /// An extent arriving after a seal starts a new region. Returns the
    /// replaced sealed region in that case.
    pub fn push_extent(&mut self, cluster: ClusterId, extent: Extent) -> Option<Region> {
        let replaced = if self.regions.get(&cluster).map_or(false, |r| r.sealed) {
            self.regions.remove(&cluster)
        } else {
            None
        };
        let region = self.regions.entry(cluster).or_default();
        region.extents.push(extent);
        region.n_rows += extent.n_rows as u64;
        replaced
    }

    /// Seal a cluster's region
    ///
    /// A cluster with no rows gets an empty sealed region. Returns false and
    /// drops the region if the row count disagrees with its extents.
    pub fn seal(&mut self, cluster: ClusterId, n_rows: u64, digest: u32) -> bool {
        let region = self.regions.entry(cluster).or_default();
        let ok = region.n_rows == n_rows && !region.sealed;
        if ok {
            region.sealed = true;
            region.digest = digest;
        } else {
            self.regions.remove(&cluster);
        }
        ok
    }

    /// Remove a cluster's region
    pub fn remove(&mut self, cluster: ClusterId) -> Option<Region> {
        self.regions.remove(&cluster)
    }

    /// Drop every unsealed region, returning the affected clusters
    pub fn drop_unsealed(&mut self) -> Vec<ClusterId> {
        let orphaned: Vec<ClusterId> = self
            .regions
            .iter()
            .filter(|(_, r)| !r.sealed)
            .map(|(c, _)| *c)
            .collect();
        for cluster in &orphaned {
            self.regions.remove(cluster);
        }
        orphaned
    }

    /// Sealed clusters, ascending
    pub fn sealed_clusters(&self) -> Vec<ClusterId> {
        self.regions
            .iter()
            .filter(|(_, r)| r.sealed)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Iterate sealed regions in ascending cluster order
    pub fn iter_sealed(&self) -> impl Iterator<Item = (ClusterId, &Region)> {
        self.regions
            .iter()
            .filter(|(_, r)| r.sealed)
            .map(|(c, r)| (*c, r))
    }

    /// Bytes held by sealed regions
    pub fn live_bytes(&self, row_len: usize) -> u64 {
        self.regions
            .values()
            .filter(|r| r.sealed)
            .map(|r| r.bytes(row_len))
            .sum()
    }

    /// Number of regions (sealed or not)
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
