//! Store items
//!
//! An item owns one or more fields: it declares them, generates them from the
//! recording, and serves them back. The store routes every field name to the
//! item that produces it.
//!
//! # Built-in Items
//!
//! | Item | Fields | Tier | Generation |
//! |------|--------|------|------------|
//! | `features_masks` | `features`, `masks` | disk | chunked scan |
//! | `waveforms` | `waveforms` | disk | chunked scan of an excerpt |
//! | `statistics` | `mean_masks`, `main_channels`, ... | memory | lazy, on first get |
//!
//! Custom items implement [`StoreItem`] and are added with
//! `ClusterStore::register_item`.

mod features_masks;
mod statistics;
mod waveforms;

pub use features_masks::{FeaturesMasksItem, FEATURES_MASKS};
pub use statistics::{Statistic, StatisticsItem, STATISTICS, UNMASKED_THRESHOLD};
pub use waveforms::{WaveformsItem, WAVEFORMS};

use crate::config::StoreConfig;
use crate::progress::{GenerateProgress, ItemReport};
use crate::recording::Recording;
use crate::store::ClusterStore;
use clusterstore_core::{
    ClusterId, FieldSpec, Result, SpikeId, SpikeIndex, SpikesPerCluster, StoreError, Tier,
};
use clusterstore_storage::{ChunkControl, ChunkProgress, DiskStore, MemoryStore};
use ndarray::{ArrayD, Axis};
use std::any::Any;

/// Everything an item may touch while generating
pub struct GenerateContext<'a> {
    /// Raw recording
    pub recording: &'a dyn Recording,
    /// Current cluster partition
    pub spike_index: &'a SpikeIndex,
    /// Disk tier
    pub disk: &'a DiskStore,
    /// Memory tier
    pub memory: &'a MemoryStore,
    /// Store configuration
    pub config: &'a StoreConfig,
    pub(crate) observer: &'a mut dyn FnMut(&GenerateProgress<'_>) -> ChunkControl,
}

impl<'a> GenerateContext<'a> {
    /// Forward a chunk notification to the store's observer
    pub fn progress(&mut self, item: &str, chunk: &ChunkProgress) -> ChunkControl {
        (self.observer)(&GenerateProgress {
            item,
            chunk: *chunk,
        })
    }
}

impl std::fmt::Debug for dyn StoreItem + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreItem").field("name", &self.name()).finish()
    }
}

/// An independently registered producer of fields
pub trait StoreItem: Send + Sync {
    /// Unique item name
    fn name(&self) -> &str;

    /// Fields produced by this item
    fn fields(&self) -> Vec<FieldSpec>;

    /// Items whose fields this item reads
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Refresh item state after the cluster partition changed
    fn prepare(&mut self, _spike_index: &SpikeIndex, _config: &StoreConfig) -> Result<()> {
        Ok(())
    }

    /// Spikes each disk field of this item holds rows for
    ///
    /// Cached regions whose spikes differ from these lists are stale. The
    /// default is the whole partition.
    fn materialized<'a>(&'a self, spike_index: &'a SpikeIndex) -> &'a SpikesPerCluster {
        spike_index.spikes_per_cluster()
    }

    /// Bulk generation; already cached entries must be skipped
    fn generate(&mut self, ctx: &mut GenerateContext<'_>) -> Result<ItemReport>;

    /// Value of one field for one cluster
    fn get(&self, store: &ClusterStore, field: &str, cluster: ClusterId) -> Result<ArrayD<f32>>;

    /// Values of several clusters, in the order given
    ///
    /// The default stacks per-cluster values along a new first axis.
    fn load_clusters(
        &self,
        store: &ClusterStore,
        field: &str,
        clusters: &[ClusterId],
    ) -> Result<ArrayD<f32>> {
        let values = clusters
            .iter()
            .map(|&c| self.get(store, field, c))
            .collect::<Result<Vec<_>>>()?;
        stack_values(field, &values)
    }

    /// Rows of individual spikes, in the order given
    ///
    /// Only per-spike fields support this; the default rejects the query.
    fn load_spikes(
        &self,
        _store: &ClusterStore,
        field: &str,
        _spikes: &[SpikeId],
    ) -> Result<ArrayD<f32>> {
        Err(StoreError::InvalidQuery(format!(
            "field '{}' is per-cluster and cannot be loaded by spikes",
            field
        )))
    }

    /// Drop the cached entries of `clusters` in both tiers
    fn invalidate(
        &mut self,
        disk: &DiskStore,
        memory: &MemoryStore,
        clusters: &[ClusterId],
    ) -> Result<()> {
        for spec in self.fields() {
            for &cluster in clusters {
                match spec.tier {
                    Tier::Disk => {
                        if disk.has_field(&spec.name) {
                            disk.invalidate_field(&spec.name, cluster)?;
                        }
                    }
                    Tier::Memory => {
                        memory.clear_field(cluster, &spec.name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Stack per-cluster values along a new first axis
pub(crate) fn stack_values(field: &str, values: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
    if values.is_empty() {
        return Err(StoreError::InvalidQuery(format!(
            "empty cluster selection for per-cluster field '{}'",
            field
        )));
    }
    let views: Vec<_> = values.iter().map(|v| v.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|_| StoreError::InconsistentShape {
        field: field.to_string(),
        expected: values[0].shape().to_vec(),
        actual: values
            .iter()
            .find(|v| v.shape() != values[0].shape())
            .map_or_else(Vec::new, |v| v.shape().to_vec()),
    })
}
