//! Lazily computed per-cluster statistics
//!
//! Statistics are cheap per cluster and rarely all needed at once, so bulk
//! generation skips them. The first `get` of a (cluster, field) computes the
//! value from other fields, checks its shape, and caches it in the memory
//! tier. A per-key in-flight slot keeps concurrent callers from computing
//! the same value twice.
//!
//! # Built-in Statistics
//!
//! | Field | Shape | Definition |
//! |-------|-------|------------|
//! | `mean_masks` | `(n_channels,)` | mean of `masks` rows |
//! | `mean_features` | `(n_channels, n_features)` | mean of `features` rows |
//! | `mean_waveforms` | `(n_samples, n_channels)` | mean of materialized `waveforms` rows |
//! | `n_unmasked_channels` | `()` | channels with `mean_masks > 0.1` |
//! | `main_channels` | `(n_channels,)` | channels by decreasing `mean_masks` |
//! | `mean_probe_position` | `(2,)` | `mean_masks`-weighted channel position |

use super::features_masks::FEATURES_MASKS;
use super::waveforms::WAVEFORMS;
use super::{GenerateContext, StoreItem};
use crate::progress::ItemReport;
use crate::store::ClusterStore;
use clusterstore_core::{validate_field_name, ClusterId, FieldSpec, Result, StoreError, Tier};
use ndarray::{Array1, ArrayD, Axis, IxDyn};
use rustc_hash::FxHashMap;
use std::any::Any;
use tracing::debug;

/// Item name
pub const STATISTICS: &str = "statistics";

/// Threshold above which a channel counts as unmasked
pub const UNMASKED_THRESHOLD: f32 = 0.1;

/// A per-cluster computation
///
/// Implemented for every `Fn(&ClusterStore, ClusterId) -> Result<ArrayD<f32>>`.
pub trait Statistic: Send + Sync {
    /// Compute the value for one cluster
    fn compute(&self, store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>>;
}

impl<F> Statistic for F
where
    F: Fn(&ClusterStore, ClusterId) -> Result<ArrayD<f32>> + Send + Sync,
{
    fn compute(&self, store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
        self(store, cluster)
    }
}

struct Entry {
    spec: FieldSpec,
    statistic: Box<dyn Statistic>,
}

/// Memory-tier statistics keyed by field name
pub struct StatisticsItem {
    order: Vec<String>,
    entries: FxHashMap<String, Entry>,
}

impl StatisticsItem {
    /// Item with no statistics
    pub fn empty() -> Self {
        Self {
            order: Vec::new(),
            entries: FxHashMap::default(),
        }
    }

    /// Item with the built-in statistics for a recording's geometry
    pub fn new(n_channels: usize, n_features: usize, n_samples: usize) -> Self {
        let mut item = Self::empty();
        item.insert(FieldSpec::memory("mean_masks", &[n_channels]), mean_masks);
        item.insert(
            FieldSpec::memory("mean_features", &[n_channels, n_features]),
            mean_features,
        );
        item.insert(
            FieldSpec::memory("mean_waveforms", &[n_samples, n_channels]),
            mean_waveforms,
        );
        item.insert(FieldSpec::memory("n_unmasked_channels", &[]), n_unmasked_channels);
        item.insert(FieldSpec::memory("main_channels", &[n_channels]), main_channels);
        item.insert(FieldSpec::memory("mean_probe_position", &[2]), mean_probe_position);
        item
    }

    fn insert(&mut self, spec: FieldSpec, statistic: impl Statistic + 'static) {
        if !self.entries.contains_key(&spec.name) {
            self.order.push(spec.name.clone());
        }
        self.entries.insert(
            spec.name.clone(),
            Entry {
                spec,
                statistic: Box::new(statistic),
            },
        );
    }

    /// Add a statistic whose shape is learned from its first value
    ///
    /// The field still has to be routed with `ClusterStore::register_field`
    /// (or added through `ClusterStore::add_statistic`, which does both).
    pub fn add(&mut self, name: &str, statistic: impl Statistic + 'static) -> Result<()> {
        self.add_with_spec(FieldSpec::memory_dynamic(name), statistic)
    }

    /// Add a statistic with a declared shape
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad name, a non-memory spec, or a name already
    /// taken.
    pub fn add_with_spec(
        &mut self,
        spec: FieldSpec,
        statistic: impl Statistic + 'static,
    ) -> Result<()> {
        validate_field_name(&spec.name)?;
        if spec.tier != Tier::Memory {
            return Err(StoreError::InvalidConfig(format!(
                "statistic '{}' must be a memory field",
                spec.name
            )));
        }
        if self.entries.contains_key(&spec.name) {
            return Err(StoreError::InvalidConfig(format!(
                "statistic '{}' already exists",
                spec.name
            )));
        }
        debug!("Added statistic '{}'", spec.name);
        self.insert(spec, statistic);
        Ok(())
    }

    /// Check if a statistic exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Statistic names in insertion order
    pub fn names(&self) -> &[String] {
        &self.order
    }
}

impl std::fmt::Debug for StatisticsItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsItem")
            .field("statistics", &self.order)
            .finish()
    }
}

impl StoreItem for StatisticsItem {
    fn name(&self) -> &str {
        STATISTICS
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| e.spec.clone()))
            .collect()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![FEATURES_MASKS.to_string(), WAVEFORMS.to_string()]
    }

    fn generate(&mut self, _ctx: &mut GenerateContext<'_>) -> Result<ItemReport> {
        Ok(ItemReport::lazy(STATISTICS))
    }

    fn get(&self, store: &ClusterStore, field: &str, cluster: ClusterId) -> Result<ArrayD<f32>> {
        if let Some(value) = store.memory().get(cluster, field) {
            return Ok(value);
        }
        let entry = self
            .entries
            .get(field)
            .ok_or_else(|| StoreError::unregistered(field))?;

        let slot = store.in_flight().slot(cluster, field);
        let _computing = slot.lock();
        if let Some(value) = store.memory().get(cluster, field) {
            return Ok(value);
        }

        debug!("Computing '{}' for cluster {}", field, cluster);
        let value = entry.statistic.compute(store, cluster)?;
        entry.spec.check_value(value.shape())?;
        store.memory().store(cluster, field, value.clone());
        Ok(value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Built-in statistics
// ============================================================================

/// Mean over the first axis; zeros for an empty cluster
fn mean_rows(rows: &ArrayD<f32>) -> ArrayD<f32> {
    rows.mean_axis(Axis(0))
        .unwrap_or_else(|| ArrayD::zeros(IxDyn(&rows.shape()[1..])))
}

fn mean_masks(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    Ok(mean_rows(&store.masks(cluster)?.into_dyn()))
}

fn mean_features(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    Ok(mean_rows(&store.features(cluster)?.into_dyn()))
}

fn mean_waveforms(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    Ok(mean_rows(&store.waveforms(cluster)?.into_dyn()))
}

fn n_unmasked_channels(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    let mm = store.mean_masks(cluster)?;
    let n = mm.iter().filter(|&&m| m > UNMASKED_THRESHOLD).count();
    Ok(ArrayD::from_elem(IxDyn(&[]), n as f32))
}

fn main_channels(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    let mm = store.mean_masks(cluster)?;
    Ok(Array1::from_iter(rank_channels(&mm).into_iter().map(|c| c as f32)).into_dyn())
}

fn mean_probe_position(store: &ClusterStore, cluster: ClusterId) -> Result<ArrayD<f32>> {
    let mm = store.mean_masks(cluster)?;
    let positions = store.recording().channel_positions();
    Ok(weighted_position(&positions, &mm)?.into_dyn())
}

/// Channel indices by decreasing weight, ties by ascending index
pub(crate) fn rank_channels(weights: &Array1<f32>) -> Vec<usize> {
    let mut channels: Vec<usize> = (0..weights.len()).collect();
    channels.sort_by(|&a, &b| {
        weights[b]
            .partial_cmp(&weights[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    channels
}

/// `sum(pos * w) / max(1, sum(w))`
pub(crate) fn weighted_position(
    positions: &ndarray::Array2<f32>,
    weights: &Array1<f32>,
) -> Result<Array1<f32>> {
    if positions.nrows() != weights.len() {
        return Err(StoreError::InconsistentShape {
            field: "channel_positions".to_string(),
            expected: vec![weights.len(), positions.ncols()],
            actual: positions.shape().to_vec(),
        });
    }
    let weighted = positions * &weights.view().insert_axis(Axis(1));
    let total = weights.sum().max(1.0);
    Ok(weighted.sum_axis(Axis(0)) / total)
}
