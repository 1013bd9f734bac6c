//! Features and masks
//!
//! Both fields are copied row by row from the recording, so they are
//! generated together in one pass: every chunk read yields one features
//! array and one masks array.

use super::{GenerateContext, StoreItem};
use crate::progress::ItemReport;
use crate::store::ClusterStore;
use clusterstore_core::{ClusterId, FieldSpec, Result, SpikeId};
use ndarray::ArrayD;
use std::any::Any;
use tracing::info;

/// Item name
pub const FEATURES_MASKS: &str = "features_masks";

/// Disk-tier `features` `(n, n_channels, n_features)` and `masks`
/// `(n, n_channels)`
#[derive(Debug, Clone)]
pub struct FeaturesMasksItem {
    n_channels: usize,
    n_features: usize,
}

impl FeaturesMasksItem {
    /// Create the item for a recording's geometry
    pub fn new(n_channels: usize, n_features: usize) -> Self {
        Self {
            n_channels,
            n_features,
        }
    }
}

impl StoreItem for FeaturesMasksItem {
    fn name(&self) -> &str {
        FEATURES_MASKS
    }

    fn fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::disk("features", &[self.n_channels, self.n_features]),
            FieldSpec::disk("masks", &[self.n_channels]),
        ]
    }

    fn generate(&mut self, ctx: &mut GenerateContext<'_>) -> Result<ItemReport> {
        let recording = ctx.recording;
        let disk = ctx.disk;
        let spike_index = ctx.spike_index;
        let chunk_size = ctx.config.features_masks_chunk_size;
        let fields = self.fields();

        let mut source = |spikes: &[SpikeId]| -> Result<Vec<ArrayD<f32>>> {
            Ok(vec![
                recording.read_features(spikes)?.into_dyn(),
                recording.read_masks(spikes)?.into_dyn(),
            ])
        };
        let report = disk.generate(
            &mut source,
            &fields,
            spike_index.spikes_per_cluster(),
            chunk_size,
            &mut |p| ctx.progress(FEATURES_MASKS, p),
        )?;
        if report.clusters_generated > 0 {
            info!(
                "Generated features and masks for {} clusters ({} spikes)",
                report.clusters_generated, report.spikes_written
            );
        }
        Ok(ItemReport::from_disk(FEATURES_MASKS, report))
    }

    fn get(&self, store: &ClusterStore, field: &str, cluster: ClusterId) -> Result<ArrayD<f32>> {
        store.disk().load(field, cluster)
    }

    fn load_clusters(
        &self,
        store: &ClusterStore,
        field: &str,
        clusters: &[ClusterId],
    ) -> Result<ArrayD<f32>> {
        store.disk().load_clusters(field, clusters)
    }

    fn load_spikes(
        &self,
        store: &ClusterStore,
        field: &str,
        spikes: &[SpikeId],
    ) -> Result<ArrayD<f32>> {
        let index = store.spike_index();
        store
            .disk()
            .load_spikes(field, spikes, index.spike_clusters(), index.spikes_per_cluster())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
