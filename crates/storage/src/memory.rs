//! Memory tier: sharded per-cluster value cache
//!
//! Holds small derived values (means, counts, channel rankings) for the
//! process lifetime. No eviction: callers only store values whose size does
//! not scale with the spike count.
//!
//! # Design
//!
//! - DashMap keyed by cluster id: one shard lock per cluster, so views
//!   touching different clusters never contend
//! - FxHashMap of field name -> value within a cluster
//! - Last writer wins; a missing entry is a normal outcome, not an error

use clusterstore_core::ClusterId;
use dashmap::DashMap;
use ndarray::ArrayD;
use rustc_hash::FxHashMap;

/// Per-cluster fields
#[derive(Debug, Default)]
struct ClusterEntry {
    fields: FxHashMap<String, ArrayD<f32>>,
}

/// Process-lifetime cache keyed by (cluster id, field name)
///
/// # Thread Safety
///
/// All operations take `&self`. Concurrent writes to the same key never
/// corrupt the map; the last write is kept. Callers that want to avoid
/// duplicate computation must serialize per key themselves.
pub struct MemoryStore {
    clusters: DashMap<ClusterId, ClusterEntry>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            clusters: DashMap::new(),
        }
    }

    /// Store a value, replacing any previous one
    pub fn store(&self, cluster: ClusterId, field: &str, value: ArrayD<f32>) {
        self.clusters
            .entry(cluster)
            .or_default()
            .fields
            .insert(field.to_string(), value);
    }

    /// Get a copy of a value
    pub fn get(&self, cluster: ClusterId, field: &str) -> Option<ArrayD<f32>> {
        self.clusters
            .get(&cluster)
            .and_then(|entry| entry.fields.get(field).cloned())
    }

    /// Check if a value is present
    pub fn contains(&self, cluster: ClusterId, field: &str) -> bool {
        self.clusters
            .get(&cluster)
            .map(|entry| entry.fields.contains_key(field))
            .unwrap_or(false)
    }

    /// Field names cached for one cluster, sorted
    pub fn fields(&self, cluster: ClusterId) -> Vec<String> {
        let mut names: Vec<String> = self
            .clusters
            .get(&cluster)
            .map(|entry| entry.fields.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Drop one field of one cluster
    pub fn clear_field(&self, cluster: ClusterId, field: &str) -> bool {
        self.clusters
            .get_mut(&cluster)
            .map(|mut entry| entry.fields.remove(field).is_some())
            .unwrap_or(false)
    }

    /// Drop every field of one cluster
    pub fn clear(&self, cluster: ClusterId) -> bool {
        self.clusters.remove(&cluster).is_some()
    }

    /// Drop everything
    pub fn clear_all(&self) {
        self.clusters.clear();
    }

    /// Clusters with at least one cached value, ascending
    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.clusters.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Total number of cached (cluster, field) entries
    pub fn len(&self) -> usize {
        self.clusters.iter().map(|e| e.value().fields.len()).sum()
    }

    /// Check if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("clusters", &self.clusters.len())
            .field("entries", &self.len())
            .finish()
    }
}
