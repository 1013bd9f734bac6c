//! Waveforms
//!
//! Only an excerpt of each large cluster is materialized (see
//! [`crate::excerpt`]). The item keeps its own spikes-per-cluster map of the
//! materialized spikes; `load` returns exactly those rows, and loading a
//! spike outside the excerpt is an `InvalidQuery`.

use super::{GenerateContext, StoreItem};
use crate::config::StoreConfig;
use crate::progress::ItemReport;
use crate::store::ClusterStore;
use clusterstore_core::{ClusterId, FieldSpec, Result, SpikeId, SpikeIndex, SpikesPerCluster};
use ndarray::ArrayD;
use std::any::Any;
use tracing::{debug, info};

/// Item name
pub const WAVEFORMS: &str = "waveforms";

/// Disk-tier `waveforms` `(n, n_samples, n_channels)` over an excerpt
#[derive(Debug, Clone)]
pub struct WaveformsItem {
    n_samples: usize,
    n_channels: usize,
    spikes_per_cluster: SpikesPerCluster,
}

impl WaveformsItem {
    /// Create the item for a recording's geometry
    pub fn new(n_samples: usize, n_channels: usize) -> Self {
        Self {
            n_samples,
            n_channels,
            spikes_per_cluster: SpikesPerCluster::new(),
        }
    }

    /// Materialized spikes of every cluster
    pub fn spikes_per_cluster(&self) -> &SpikesPerCluster {
        &self.spikes_per_cluster
    }

    /// Materialized spikes of one cluster
    pub fn spikes(&self, cluster: ClusterId) -> Option<&[SpikeId]> {
        self.spikes_per_cluster.get(&cluster).map(|v| v.as_slice())
    }

    fn refresh(&mut self, spike_index: &SpikeIndex, config: &StoreConfig) -> Result<()> {
        let policy = config.excerpt_policy()?;
        self.spikes_per_cluster = spike_index
            .spikes_per_cluster()
            .iter()
            .map(|(&cluster, spikes)| (cluster, policy.apply(spikes)))
            .collect();
        let materialized: usize = self.spikes_per_cluster.values().map(|v| v.len()).sum();
        debug!(
            "Waveform excerpt: {} of {} spikes",
            materialized,
            spike_index.n_spikes_total()
        );
        Ok(())
    }
}

impl StoreItem for WaveformsItem {
    fn name(&self) -> &str {
        WAVEFORMS
    }

    fn fields(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::disk(WAVEFORMS, &[self.n_samples, self.n_channels])]
    }

    fn prepare(&mut self, spike_index: &SpikeIndex, config: &StoreConfig) -> Result<()> {
        self.refresh(spike_index, config)
    }

    fn materialized<'a>(&'a self, _spike_index: &'a SpikeIndex) -> &'a SpikesPerCluster {
        &self.spikes_per_cluster
    }

    fn generate(&mut self, ctx: &mut GenerateContext<'_>) -> Result<ItemReport> {
        self.refresh(ctx.spike_index, ctx.config)?;

        let recording = ctx.recording;
        let disk = ctx.disk;
        let chunk_size = ctx.config.waveforms_chunk_size;
        let fields = self.fields();

        let mut source = |spikes: &[SpikeId]| -> Result<Vec<ArrayD<f32>>> {
            Ok(vec![recording.read_waveforms(spikes)?.into_dyn()])
        };
        let report = disk.generate(
            &mut source,
            &fields,
            &self.spikes_per_cluster,
            chunk_size,
            &mut |p| ctx.progress(WAVEFORMS, p),
        )?;
        if report.clusters_generated > 0 {
            info!(
                "Generated waveforms for {} clusters ({} spikes)",
                report.clusters_generated, report.spikes_written
            );
        }
        Ok(ItemReport::from_disk(WAVEFORMS, report))
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
        store.disk().load_spikes(
            field,
            spikes,
            store.spike_index().spike_clusters(),
            &self.spikes_per_cluster,
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
