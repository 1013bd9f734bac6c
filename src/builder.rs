//! Store construction
//!
//! [`StoreBuilder`] layers explicit settings over the `store.json` already in
//! the cache directory (if any), which in turn overrides the defaults. The
//! resulting store has the three built-in items registered.

use clusterstore_core::{Result, StoreError};
use clusterstore_engine::{ClusterStore, Recording, StoreConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Open a store over `recording` cached in `path`
///
/// # Example
///
/// ```ignore
/// use clusterstore::prelude::*;
///
/// let recording = Arc::new(MockRecording::new().build()?);
/// let mut store = create_store(recording, "./cache", StoreConfig::default())?;
/// store.generate()?;
/// let features = store.features(0)?;
/// ```
pub fn create_store(
    recording: Arc<dyn Recording>,
    path: impl AsRef<Path>,
    config: StoreConfig,
) -> Result<ClusterStore> {
    ClusterStore::with_default_items(recording, path, config)
}

/// Builder for a [`ClusterStore`]
///
/// # Example
///
/// ```ignore
/// let store = StoreBuilder::new(recording)
///     .path("./cache")
///     .features_masks_chunk_size(50_000)
///     .waveforms_n_spikes_max(200)
///     .open()?;
/// ```
pub struct StoreBuilder {
    recording: Arc<dyn Recording>,
    path: Option<PathBuf>,
    features_masks_chunk_size: Option<usize>,
    waveforms_chunk_size: Option<usize>,
    waveforms_n_spikes_max: Option<usize>,
    waveforms_excerpt_size: Option<usize>,
    compaction_dead_ratio: Option<f64>,
}

impl StoreBuilder {
    /// Create a builder over a recording
    pub fn new(recording: Arc<dyn Recording>) -> Self {
        Self {
            recording,
            path: None,
            features_masks_chunk_size: None,
            waveforms_chunk_size: None,
            waveforms_n_spikes_max: None,
            waveforms_excerpt_size: None,
            compaction_dead_ratio: None,
        }
    }

    /// Set the cache directory (required)
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Spikes per chunk when generating features and masks
    pub fn features_masks_chunk_size(mut self, n: usize) -> Self {
        self.features_masks_chunk_size = Some(n);
        self
    }

    /// Spikes per chunk when generating waveforms
    pub fn waveforms_chunk_size(mut self, n: usize) -> Self {
        self.waveforms_chunk_size = Some(n);
        self
    }

    /// Upper bound on materialized waveforms per cluster
    pub fn waveforms_n_spikes_max(mut self, n: usize) -> Self {
        self.waveforms_n_spikes_max = Some(n);
        self
    }

    /// Length of each contiguous waveform excerpt
    pub fn waveforms_excerpt_size(mut self, n: usize) -> Self {
        self.waveforms_excerpt_size = Some(n);
        self
    }

    /// Dead-byte ratio above which a chunk file is compacted
    pub fn compaction_dead_ratio(mut self, ratio: f64) -> Self {
        self.compaction_dead_ratio = Some(ratio);
        self
    }

    /// Resolve the configuration without opening the store
    pub fn config(&self) -> Result<StoreConfig> {
        let path = self.require_path()?;
        let mut config = match StoreConfig::load(path)? {
            Some(persisted) => {
                debug!("Using persisted configuration from {}", path.display());
                persisted
            }
            None => StoreConfig::default(),
        };
        if let Some(n) = self.features_masks_chunk_size {
            config.features_masks_chunk_size = n;
        }
        if let Some(n) = self.waveforms_chunk_size {
            config.waveforms_chunk_size = n;
        }
        if let Some(n) = self.waveforms_n_spikes_max {
            config.waveforms_n_spikes_max = n;
        }
        if let Some(n) = self.waveforms_excerpt_size {
            config.waveforms_excerpt_size = n;
        }
        if let Some(r) = self.compaction_dead_ratio {
            config.compaction_dead_ratio = r;
        }
        config.validate()?;
        Ok(config)
    }

    fn require_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| StoreError::InvalidConfig("no cache directory given".to_string()))
    }

    /// Open the store with the built-in items registered
    ///
    /// # Errors
    ///
    /// `InvalidConfig` without a path or with invalid settings, plus any
    /// error of [`ClusterStore::open`].
    pub fn open(self) -> Result<ClusterStore> {
        let config = self.config()?;
        let path = self.require_path()?.to_path_buf();
        create_store(self.recording, path, config)
    }
}

impl std::fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("path", &self.path)
            .field("features_masks_chunk_size", &self.features_masks_chunk_size)
            .field("waveforms_n_spikes_max", &self.waveforms_n_spikes_max)
            .field("waveforms_excerpt_size", &self.waveforms_excerpt_size)
            .finish_non_exhaustive()
    }
}
