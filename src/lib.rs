//! # ClusterStore
//!
//! Two-tier per-cluster data cache for spike-sorted recordings.
//!
//! A recording assigns every spike to a cluster. ClusterStore precomputes
//! per-cluster views of the raw data and serves them back by cluster or by
//! spike:
//!
//! - **Disk tier**: per-spike arrays (`features`, `masks`, `waveforms`)
//!   written cluster-contiguous into one chunk file per field, generated in
//!   bounded chunks and recovered on reopen.
//! - **Memory tier**: small derived statistics (`mean_masks`,
//!   `main_channels`, ...) computed on first access and kept for the process
//!   lifetime.
//!
//! ## Quick Start
//!
//! ```ignore
//! use clusterstore::prelude::*;
//!
//! let recording = Arc::new(MockRecording::new().build()?);
//! let mut store = StoreBuilder::new(recording).path("./cache").open()?;
//!
//! // One pass over the recording, chunk by chunk
//! store.generate()?;
//!
//! // Caller order is preserved
//! let features = store.load("features", &Query::clusters(vec![3, 1]))?;
//! let mean = store.mean_masks(3)?;
//!
//! // After a merge, only the affected clusters are regenerated
//! store.set_assignment(&new_spike_clusters)?;
//! store.generate()?;
//! ```
//!
//! ## Crates
//!
//! - `clusterstore-core`: ids, field declarations, errors, the spike index
//! - `clusterstore-storage`: the memory and disk tiers
//! - `clusterstore-engine`: items, generation, the store itself

#![warn(missing_docs)]

mod builder;

pub mod prelude;

// Re-export main entry points
pub use builder::{create_store, StoreBuilder};
pub use clusterstore_engine::{ClusterStore, Query, Selector, StoreConfig};

// Re-export error handling
pub use clusterstore_core::{Result, StoreError};

// Re-export core types
pub use clusterstore_core::{
    AssignmentDelta, ClusterId, FieldSpec, FieldState, SelectionIndex, Shape, SpikeId,
    SpikeIndex, SpikesPerCluster, Tier,
};

// Re-export items and recordings
pub use clusterstore_engine::{
    FeaturesMasksItem, GenerateProgress, GenerateReport, InMemoryRecording, ItemReport,
    MockRecording, Recording, Statistic, StatisticsItem, StoreItem, WaveformsItem,
};

// Re-export storage
pub use clusterstore_storage::{ChunkControl, ChunkProgress, CompactionReport, RecoveryReport};

/// Lower layers, for custom items and tooling
pub mod layers {
    pub use clusterstore_core as core;
    pub use clusterstore_engine as engine;
    pub use clusterstore_storage as storage;
}
