//! ClusterStore: the orchestrator
//!
//! Owns the cluster partition, both storage tiers and the item registry.
//!
//! ## Lifecycle
//!
//! ```text
//! open(recording, dir, config)     spike index built, config persisted
//!   register_item(...)             disk fields opened and recovered
//!   generate()                     items in dependency order, chunk by chunk
//!   load(field, query)             routed to the owning item
//!   set_assignment(...)            changed clusters invalidated in every tier
//!   generate()                     only missing work is redone
//! ```
//!
//! ## Concurrency
//!
//! `generate()` and everything that changes the partition take `&mut self`,
//! so bulk generation never interleaves with lazy gets. Loads take `&self`;
//! lazy statistics serialize per (cluster, field) through an in-flight slot.

use crate::config::StoreConfig;
use crate::guard::InFlight;
use crate::items::{
    FeaturesMasksItem, GenerateContext, Statistic, StatisticsItem, StoreItem, WaveformsItem,
    STATISTICS, WAVEFORMS,
};
use crate::progress::{GenerateProgress, GenerateReport};
use crate::recording::Recording;
use crate::registry::ItemRegistry;
use clusterstore_core::{
    relative_cluster_index, select, AssignmentDelta, ClusterId, FieldSpec, FieldState, Result,
    SelectionIndex, SpikeId, SpikeIndex, SpikesPerCluster, StoreError, Tier,
};
use clusterstore_storage::{ChunkControl, CompactionReport, DiskStore, MemoryStore};
use ndarray::{Array1, Array2, Array3, ArrayD, Ix1, Ix2, Ix3};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Query
// ============================================================================

/// Selector for [`ClusterStore::load`]
///
/// Exactly one of `clusters` or `spikes` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    clusters: Option<Vec<ClusterId>>,
    spikes: Option<Vec<SpikeId>>,
}

/// Validated selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    /// Whole clusters, in caller order
    Clusters(&'a [ClusterId]),
    /// Individual spikes, in caller order
    Spikes(&'a [SpikeId]),
}

impl Query {
    /// Select whole clusters
    pub fn clusters(clusters: impl Into<Vec<ClusterId>>) -> Self {
        Self {
            clusters: Some(clusters.into()),
            spikes: None,
        }
    }

    /// Select individual spikes
    pub fn spikes(spikes: impl Into<Vec<SpikeId>>) -> Self {
        Self {
            clusters: None,
            spikes: Some(spikes.into()),
        }
    }

    /// Add a cluster selector
    pub fn with_clusters(mut self, clusters: impl Into<Vec<ClusterId>>) -> Self {
        self.clusters = Some(clusters.into());
        self
    }

    /// Add a spike selector
    pub fn with_spikes(mut self, spikes: impl Into<Vec<SpikeId>>) -> Self {
        self.spikes = Some(spikes.into());
        self
    }

    /// Check that exactly one selector is set
    ///
    /// # Errors
    ///
    /// `InvalidQuery` if both or neither are set.
    pub fn selector(&self) -> Result<Selector<'_>> {
        match (&self.clusters, &self.spikes) {
            (Some(c), None) => Ok(Selector::Clusters(c)),
            (None, Some(s)) => Ok(Selector::Spikes(s)),
            (Some(_), Some(_)) => Err(StoreError::InvalidQuery(
                "give either clusters or spikes, not both".to_string(),
            )),
            (None, None) => Err(StoreError::InvalidQuery(
                "give clusters or spikes".to_string(),
            )),
        }
    }
}

// ============================================================================
// ClusterStore
// ============================================================================

/// Two-tier per-cluster cache over a recording
pub struct ClusterStore {
    recording: Arc<dyn Recording>,
    config: StoreConfig,
    root: PathBuf,
    spike_index: SpikeIndex,
    memory: MemoryStore,
    disk: DiskStore,
    registry: ItemRegistry,
    in_flight: InFlight,
}

impl ClusterStore {
    /// Open a store over a recording with no items registered
    ///
    /// The configuration is validated and written to `store.json` in `root`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings, `InvalidAssignment` for a malformed
    /// `spike_clusters`, `StorageIo` if the directory cannot be created.
    pub fn open(
        recording: Arc<dyn Recording>,
        root: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        let spike_index = SpikeIndex::build(&recording.spike_clusters())?;
        let disk = DiskStore::open(&root)?;
        config.save(&root)?;
        info!(
            "Opened cluster store at {} ({} spikes, {} clusters)",
            root.display(),
            spike_index.n_spikes_total(),
            spike_index.n_clusters()
        );
        Ok(Self {
            recording,
            config,
            root,
            spike_index,
            memory: MemoryStore::new(),
            disk,
            registry: ItemRegistry::new(),
            in_flight: InFlight::new(),
        })
    }

    /// Open a store with the built-in features/masks, waveforms and
    /// statistics items
    pub fn with_default_items(
        recording: Arc<dyn Recording>,
        root: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self> {
        let nc = recording.n_channels();
        let nf = recording.n_features_per_channel();
        let ns = recording.n_samples_waveforms();
        let mut store = Self::open(recording, root, config)?;
        store.register_item(Box::new(FeaturesMasksItem::new(nc, nf)))?;
        store.register_item(Box::new(WaveformsItem::new(ns, nc)))?;
        store.register_item(Box::new(StatisticsItem::new(nc, nf, ns)))?;
        Ok(store)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Raw recording
    pub fn recording(&self) -> &dyn Recording {
        self.recording.as_ref()
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current cluster partition
    pub fn spike_index(&self) -> &SpikeIndex {
        &self.spike_index
    }

    /// Spikes of every cluster
    pub fn spikes_per_cluster(&self) -> &SpikesPerCluster {
        self.spike_index.spikes_per_cluster()
    }

    /// Cluster ids, ascending
    pub fn clusters(&self) -> Vec<ClusterId> {
        self.spike_index.clusters()
    }

    /// Memory tier
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Disk tier
    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    pub(crate) fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Item by name
    pub fn item(&self, name: &str) -> Option<&dyn StoreItem> {
        self.registry.get(name)
    }

    /// Item by name and concrete type
    pub fn item_as<T: StoreItem + 'static>(&self, name: &str) -> Option<&T> {
        self.registry.get(name)?.as_any().downcast_ref::<T>()
    }

    /// Mutable item by name and concrete type
    pub fn item_as_mut<T: StoreItem + 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.registry.get_mut(name)?.as_any_mut().downcast_mut::<T>()
    }

    /// The built-in waveforms item
    pub fn waveforms_item(&self) -> Option<&WaveformsItem> {
        self.item_as(WAVEFORMS)
    }

    /// The built-in statistics item
    pub fn statistics_mut(&mut self) -> Option<&mut StatisticsItem> {
        self.item_as_mut(STATISTICS)
    }

    /// Item names in registration order
    pub fn item_names(&self) -> Vec<&str> {
        self.registry.item_names()
    }

    /// Routed field names, sorted
    pub fn field_names(&self) -> Vec<String> {
        self.registry.field_names()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an item
    ///
    /// Disk fields of the item are opened and recovered from their chunk
    /// files, so a reopened store serves previously generated clusters
    /// without regenerating them. Recovered regions whose spikes no longer
    /// match the current partition are dropped before anything can load them.
    pub fn register_item(&mut self, mut item: Box<dyn StoreItem>) -> Result<()> {
        let fields = item.fields();
        for spec in fields.iter().filter(|f| f.tier == Tier::Disk) {
            let report = self.disk.register_field(spec)?;
            debug!(
                "Disk field '{}' ready: {:?}, {} regions",
                spec.name, report.source, report.regions
            );
        }
        item.prepare(&self.spike_index, &self.config)?;
        let stale = drop_stale_regions(&self.disk, item.as_ref(), &self.spike_index)?;
        self.forget_memory(&stale);
        let name = item.name().to_string();
        self.registry.register(item)?;
        info!("Registered item '{}' with {} fields", name, fields.len());
        Ok(())
    }

    /// Route a field to the item that produces it
    pub fn register_field(&mut self, field: &str, item_name: &str) -> Result<()> {
        self.registry.route(field, item_name)
    }

    /// Add a statistic to the statistics item and route it
    ///
    /// Works before or after `generate()`; no disk regeneration is needed.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if there is no statistics item or the name is taken.
    pub fn add_statistic(&mut self, name: &str, statistic: impl Statistic + 'static) -> Result<()> {
        self.statistics_mut()
            .ok_or_else(|| StoreError::InvalidConfig("no statistics item registered".to_string()))?
            .add(name, statistic)?;
        self.register_field(name, STATISTICS)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Generate every item
    pub fn generate(&mut self) -> Result<GenerateReport> {
        self.generate_with(&mut |_| ChunkControl::Continue)
    }

    /// Generate every item, reporting after each chunk
    ///
    /// Returning [`ChunkControl::Stop`] from the observer ends generation
    /// after the current chunk; every cluster sealed so far stays cached and a
    /// later call completes the rest.
    pub fn generate_with(
        &mut self,
        observer: &mut dyn FnMut(&GenerateProgress<'_>) -> ChunkControl,
    ) -> Result<GenerateReport> {
        let order = self.registry.generation_order()?;
        let mut report = GenerateReport::default();

        for idx in order {
            let item = self.registry.at_mut(idx);
            let mut ctx = GenerateContext {
                recording: self.recording.as_ref(),
                spike_index: &self.spike_index,
                disk: &self.disk,
                memory: &self.memory,
                config: &self.config,
                observer: &mut *observer,
            };
            let item_report = match item.generate(&mut ctx) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Generation of item '{}' failed: {}", item.name(), e);
                    return Err(e);
                }
            };
            let cancelled = item_report.cancelled;
            report.items.push(item_report);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        if !report.cancelled {
            report.compactions = self.disk.maybe_compact(self.config.compaction_dead_ratio)?;
        }
        self.disk.flush()?;
        info!("Generation finished: {}", report.summary());
        Ok(report)
    }

    // ========================================================================
    // Loads
    // ========================================================================

    /// Load a field for a selection, in the caller's order
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for a bad selector or unknown ids, `MissingField` for
    /// unrouted fields or clusters not yet generated.
    pub fn load(&self, field: &str, query: &Query) -> Result<ArrayD<f32>> {
        let owner = self.registry.owner(field)?;
        match query.selector()? {
            Selector::Clusters(clusters) => {
                self.check_clusters(clusters)?;
                owner.load_clusters(self, field, clusters)
            }
            Selector::Spikes(spikes) => {
                let n = self.spike_index.n_spikes_total();
                if let Some(s) = spikes.iter().find(|&&s| s >= n) {
                    return Err(StoreError::InvalidQuery(format!(
                        "spike {} is out of range ({} spikes)",
                        s, n
                    )));
                }
                owner.load_spikes(self, field, spikes)
            }
        }
    }

    /// Load a field for whole clusters
    pub fn load_clusters(&self, field: &str, clusters: &[ClusterId]) -> Result<ArrayD<f32>> {
        self.load(field, &Query::clusters(clusters))
    }

    /// Load a field for individual spikes
    pub fn load_spikes(&self, field: &str, spikes: &[SpikeId]) -> Result<ArrayD<f32>> {
        self.load(field, &Query::spikes(spikes))
    }

    /// Value of a field for one cluster
    pub fn get(&self, field: &str, cluster: ClusterId) -> Result<ArrayD<f32>> {
        let owner = self.registry.owner(field)?;
        self.check_clusters(&[cluster])?;
        owner.get(self, field, cluster)
    }

    fn check_clusters(&self, clusters: &[ClusterId]) -> Result<()> {
        match clusters.iter().find(|c| !self.spike_index.contains(**c)) {
            Some(c) => Err(StoreError::InvalidQuery(format!("unknown cluster {}", c))),
            None => Ok(()),
        }
    }

    fn get_typed<D: ndarray::Dimension>(
        &self,
        field: &str,
        cluster: ClusterId,
    ) -> Result<ndarray::Array<f32, D>> {
        let value = self.get(field, cluster)?;
        let shape = value.shape().to_vec();
        value
            .into_dimensionality::<D>()
            .map_err(|_| StoreError::InconsistentShape {
                field: field.to_string(),
                expected: Vec::new(),
                actual: shape,
            })
    }

    /// Features of a cluster, `(n_spikes, n_channels, n_features)`
    pub fn features(&self, cluster: ClusterId) -> Result<Array3<f32>> {
        self.get_typed::<Ix3>("features", cluster)
    }

    /// Masks of a cluster, `(n_spikes, n_channels)`
    pub fn masks(&self, cluster: ClusterId) -> Result<Array2<f32>> {
        self.get_typed::<Ix2>("masks", cluster)
    }

    /// Materialized waveforms of a cluster, `(n_excerpt, n_samples, n_channels)`
    pub fn waveforms(&self, cluster: ClusterId) -> Result<Array3<f32>> {
        self.get_typed::<Ix3>("waveforms", cluster)
    }

    /// Mean mask per channel
    pub fn mean_masks(&self, cluster: ClusterId) -> Result<Array1<f32>> {
        self.get_typed::<Ix1>("mean_masks", cluster)
    }

    /// Mean features, `(n_channels, n_features)`
    pub fn mean_features(&self, cluster: ClusterId) -> Result<Array2<f32>> {
        self.get_typed::<Ix2>("mean_features", cluster)
    }

    /// Mean of the materialized waveforms, `(n_samples, n_channels)`
    pub fn mean_waveforms(&self, cluster: ClusterId) -> Result<Array2<f32>> {
        self.get_typed::<Ix2>("mean_waveforms", cluster)
    }

    /// Channels whose mean mask exceeds 0.1
    pub fn n_unmasked_channels(&self, cluster: ClusterId) -> Result<usize> {
        let value = self.get("n_unmasked_channels", cluster)?;
        value
            .iter()
            .next()
            .map(|&v| v as usize)
            .ok_or_else(|| StoreError::InconsistentShape {
                field: "n_unmasked_channels".to_string(),
                expected: Vec::new(),
                actual: value.shape().to_vec(),
            })
    }

    /// Channels by decreasing mean mask
    pub fn main_channels(&self, cluster: ClusterId) -> Result<Vec<usize>> {
        Ok(self
            .get_typed::<Ix1>("main_channels", cluster)?
            .iter()
            .map(|&c| c as usize)
            .collect())
    }

    /// Mask-weighted probe position, `(2,)`
    pub fn mean_probe_position(&self, cluster: ClusterId) -> Result<Array1<f32>> {
        self.get_typed::<Ix1>("mean_probe_position", cluster)
    }

    /// Any statistic by name
    pub fn statistic(&self, name: &str, cluster: ClusterId) -> Result<ArrayD<f32>> {
        self.get(name, cluster)
    }

    /// Spikes of an ordered cluster selection with their relative index
    pub fn select(&self, clusters: &[ClusterId]) -> Result<SelectionIndex> {
        select(self.spike_index.spikes_per_cluster(), clusters)
    }

    /// Position in `cluster_order` of each spike's cluster
    ///
    /// Spikes may come in any order, e.g. from a spike-based load; the result
    /// lines up with them for batched per-cluster colouring.
    pub fn relative_cluster_index(
        &self,
        spikes: &[SpikeId],
        cluster_order: &[ClusterId],
    ) -> Result<Vec<usize>> {
        relative_cluster_index(self.spike_index.spike_clusters(), spikes, cluster_order)
    }

    /// Cache state of one (cluster, field)
    pub fn field_state(&self, cluster: ClusterId, field: &str) -> Result<FieldState> {
        let spec: FieldSpec = self.registry.spec(field)?;
        let cached = match spec.tier {
            Tier::Disk => self.disk.is_cached(field, cluster),
            Tier::Memory => self.memory.contains(cluster, field),
        };
        Ok(if cached {
            FieldState::Cached
        } else if self.in_flight.is_busy(cluster, field) {
            FieldState::Generating
        } else {
            FieldState::Ungenerated
        })
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Replace the cluster assignment after a merge or split
    ///
    /// Clusters that disappeared or whose spikes changed are invalidated in
    /// every tier; all other cache entries are kept.
    pub fn set_assignment(&mut self, spike_clusters: &[i64]) -> Result<AssignmentDelta> {
        let newer = SpikeIndex::build(spike_clusters)?;
        if newer.n_spikes_total() != self.spike_index.n_spikes_total() {
            return Err(StoreError::InvalidAssignment(format!(
                "assignment has {} spikes, recording has {}",
                newer.n_spikes_total(),
                self.spike_index.n_spikes_total()
            )));
        }
        let delta = self.spike_index.diff(&newer);
        let stale = delta.invalidated();
        self.invalidate_many(&stale)?;
        self.spike_index = newer;
        let mut dropped = Vec::new();
        for item in self.registry.iter_mut() {
            item.prepare(&self.spike_index, &self.config)?;
            dropped.extend(drop_stale_regions(&self.disk, item.as_ref(), &self.spike_index)?);
        }
        self.forget_memory(&dropped);
        info!(
            "Assignment changed: {} removed, {} added, {} changed",
            delta.removed.len(),
            delta.added.len(),
            delta.changed.len()
        );
        Ok(delta)
    }

    /// Drop every cached field of a cluster
    pub fn invalidate(&mut self, cluster: ClusterId) -> Result<()> {
        self.invalidate_many(&[cluster])
    }

    fn invalidate_many(&mut self, clusters: &[ClusterId]) -> Result<()> {
        if clusters.is_empty() {
            return Ok(());
        }
        for item in self.registry.iter_mut() {
            item.invalidate(&self.disk, &self.memory, clusters)?;
        }
        self.forget_memory(clusters);
        debug!("Invalidated clusters {:?}", clusters);
        Ok(())
    }

    fn forget_memory(&self, clusters: &[ClusterId]) {
        for &cluster in clusters {
            self.memory.clear(cluster);
            self.in_flight.forget(cluster);
        }
    }

    /// Invalidate a cluster and reclaim disk space if enough is dead
    pub fn delete_cluster(&mut self, cluster: ClusterId) -> Result<()> {
        self.invalidate(cluster)?;
        let reports = self.disk.maybe_compact(self.config.compaction_dead_ratio)?;
        if !reports.is_empty() {
            info!(
                "Deleted cluster {}, compacted {} files",
                cluster,
                reports.len()
            );
        }
        Ok(())
    }

    /// Compact every disk field
    pub fn compact(&self) -> Result<Vec<CompactionReport>> {
        self.disk
            .field_names()
            .iter()
            .map(|f| self.disk.compact(f))
            .collect()
    }

    /// Write every dirty manifest
    pub fn flush(&self) -> Result<()> {
        self.disk.flush()
    }
}

/// Tombstone the disk regions of an item that its current spike lists no
/// longer describe
fn drop_stale_regions(
    disk: &DiskStore,
    item: &dyn StoreItem,
    spike_index: &SpikeIndex,
) -> Result<Vec<ClusterId>> {
    let materialized = item.materialized(spike_index);
    let mut dropped = Vec::new();
    for spec in item.fields().iter().filter(|f| f.tier == Tier::Disk) {
        dropped.extend(disk.drop_stale(&spec.name, materialized)?);
    }
    dropped.sort_unstable();
    dropped.dedup();
    Ok(dropped)
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("root", &self.root)
            .field("n_spikes", &self.spike_index.n_spikes_total())
            .field("n_clusters", &self.spike_index.n_clusters())
            .field("registry", &self.registry)
            .finish()
    }
}
